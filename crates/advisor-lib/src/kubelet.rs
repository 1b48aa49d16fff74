//! Kubelet reserved-resources configuration client
//!
//! Reads the kubelet's read-only config endpoint and extracts the reserved
//! cpu and memory quantities. Everything else in the payload is ignored.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct KubeletConfigPayload {
    kubeletconfig: KubeletConfigSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfigSection {
    #[serde(default)]
    system_reserved: BTreeMap<String, String>,
    #[serde(default)]
    kube_reserved: BTreeMap<String, String>,
}

/// Reserved quantities the advisor consumes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReservedResources {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

pub struct KubeletConfigClient {
    endpoint: String,
    client: reqwest::Client,
}

impl KubeletConfigClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build kubelet config client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Fetch and sum system and kube reservations
    pub async fn get_reserved(&self) -> Result<ReservedResources> {
        let payload: KubeletConfigPayload = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .context("kubelet config request failed")?
            .error_for_status()
            .context("kubelet config returned an error status")?
            .json()
            .await
            .context("kubelet config payload decode failed")?;

        let reserved = sum_reserved(&payload.kubeletconfig);
        debug!(?reserved, "kubelet reserved resources fetched");
        Ok(reserved)
    }
}

fn sum_reserved(section: &KubeletConfigSection) -> ReservedResources {
    let mut reserved = ReservedResources::default();
    for source in [&section.system_reserved, &section.kube_reserved] {
        if let Some(cpu) = source.get("cpu") {
            if let Ok(cores) = parse_cpu_quantity(cpu) {
                reserved.cpu_cores += cores;
            }
        }
        if let Some(memory) = source.get("memory") {
            if let Ok(bytes) = parse_memory_quantity(memory) {
                reserved.memory_bytes += bytes;
            }
        }
    }
    reserved
}

/// Parse cpu quantity strings: "2", "1500m"
pub fn parse_cpu_quantity(quantity: &str) -> Result<f64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        let value: f64 = millis
            .parse()
            .with_context(|| format!("invalid cpu quantity {}", quantity))?;
        return Ok(value / 1000.0);
    }
    quantity
        .parse()
        .with_context(|| format!("invalid cpu quantity {}", quantity))
}

/// Parse memory quantity strings: "1024", "2Gi", "512Mi", "1G"
pub fn parse_memory_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let suffixes: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1u64 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in suffixes {
        if let Some(value) = quantity.strip_suffix(suffix) {
            let value: f64 = value
                .parse()
                .with_context(|| format!("invalid memory quantity {}", quantity))?;
            return Ok((value * factor as f64) as u64);
        }
    }
    if quantity.chars().all(|c| c.is_ascii_digit()) {
        return quantity
            .parse()
            .with_context(|| format!("invalid memory quantity {}", quantity));
    }
    bail!("invalid memory quantity {}", quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_quantities() {
        assert_eq!(parse_cpu_quantity("2").unwrap(), 2.0);
        assert_eq!(parse_cpu_quantity("1500m").unwrap(), 1.5);
        assert_eq!(parse_cpu_quantity("250m").unwrap(), 0.25);
        assert!(parse_cpu_quantity("abc").is_err());
    }

    #[test]
    fn test_parse_memory_quantities() {
        assert_eq!(parse_memory_quantity("1024").unwrap(), 1024);
        assert_eq!(parse_memory_quantity("2Gi").unwrap(), 2 * (1 << 30));
        assert_eq!(parse_memory_quantity("512Mi").unwrap(), 512 * (1 << 20));
        assert_eq!(parse_memory_quantity("1G").unwrap(), 1_000_000_000);
        assert!(parse_memory_quantity("2Xi").is_err());
    }

    #[test]
    fn test_sum_reserved_only_cpu_and_memory() {
        let section: KubeletConfigSection = serde_json::from_value(serde_json::json!({
            "systemReserved": {"cpu": "1", "memory": "1Gi", "ephemeral-storage": "10Gi"},
            "kubeReserved": {"cpu": "500m", "memory": "512Mi"}
        }))
        .unwrap();

        let reserved = sum_reserved(&section);
        assert_eq!(reserved.cpu_cores, 1.5);
        assert_eq!(reserved.memory_bytes, (1 << 30) + 512 * (1 << 20));
    }

    #[test]
    fn test_payload_decoding() {
        let payload: KubeletConfigPayload = serde_json::from_value(serde_json::json!({
            "kubeletconfig": {
                "systemReserved": {"cpu": "2", "memory": "2Gi"},
                "port": 10250
            }
        }))
        .unwrap();
        let reserved = sum_reserved(&payload.kubeletconfig);
        assert_eq!(reserved.cpu_cores, 2.0);
    }
}
