//! Metric and pod providers
//!
//! Metric acquisition is an injected interface: the advisor core only fixes
//! the names it reads and the failure contract (a single failed metric is a
//! hard error for the current tick).

use crate::models::PodInfo;
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Metric names the advisor core assumes the provider serves
pub mod names {
    pub const MEM_FREE_NUMA: &str = "mem.free.numa";
    pub const MEM_INACTIVE_FILE_NUMA: &str = "mem.inactiveFile.numa";
    pub const MEM_TOTAL_NUMA: &str = "mem.total.numa";
    pub const MEM_SCALE_FACTOR_SYSTEM: &str = "mem.scaleFactor.system";
    pub const MEM_CACHE_CONTAINER: &str = "mem.cache.container";
    pub const MEM_FILE_PER_NUMA_CONTAINER: &str = "mem.file.perNuma.container";
    pub const CPU_LOAD_1MIN_CONTAINER: &str = "cpu.load.1min.container";
    pub const CPU_USAGE_CONTAINER: &str = "cpu.usage.container";
}

/// A sampled metric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricData {
    pub value: f64,
    pub timestamp: i64,
}

impl MetricData {
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Provider of node, NUMA, and container scoped metrics
#[async_trait]
pub trait MetricsFetcher: Send + Sync {
    async fn get_node_metric(&self, name: &str) -> Result<MetricData>;

    async fn get_numa_metric(&self, numa_id: i32, name: &str) -> Result<MetricData>;

    /// `numa_id` of `None` addresses the container-wide value
    async fn get_container_metric(
        &self,
        pod_uid: &str,
        container_name: &str,
        name: &str,
        numa_id: Option<i32>,
    ) -> Result<MetricData>;
}

/// Provider of the node's pod list
#[async_trait]
pub trait PodFetcher: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<PodInfo>>;
}

/// In-memory metrics store for tests and local development
#[derive(Default)]
pub struct FakeMetricsFetcher {
    node_metrics: DashMap<String, f64>,
    numa_metrics: DashMap<(i32, String), f64>,
    container_metrics: DashMap<(String, String, String, i32), f64>,
}

/// Container-wide values are stored under this key; real NUMA ids are >= 0
const WHOLE_CONTAINER: i32 = -1;

impl FakeMetricsFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node_metric(&self, name: &str, value: f64) {
        self.node_metrics.insert(name.to_string(), value);
    }

    pub fn set_numa_metric(&self, numa_id: i32, name: &str, value: f64) {
        self.numa_metrics.insert((numa_id, name.to_string()), value);
    }

    pub fn set_container_metric(
        &self,
        pod_uid: &str,
        container_name: &str,
        name: &str,
        numa_id: Option<i32>,
        value: f64,
    ) {
        let key = (
            pod_uid.to_string(),
            container_name.to_string(),
            name.to_string(),
            numa_id.unwrap_or(WHOLE_CONTAINER),
        );
        self.container_metrics.insert(key, value);
    }

    pub fn remove_node_metric(&self, name: &str) {
        self.node_metrics.remove(name);
    }

    pub fn remove_numa_metric(&self, numa_id: i32, name: &str) {
        self.numa_metrics.remove(&(numa_id, name.to_string()));
    }
}

#[async_trait]
impl MetricsFetcher for FakeMetricsFetcher {
    async fn get_node_metric(&self, name: &str) -> Result<MetricData> {
        self.node_metrics
            .get(name)
            .map(|v| MetricData::now(*v))
            .ok_or_else(|| anyhow!("node metric {} not found", name))
    }

    async fn get_numa_metric(&self, numa_id: i32, name: &str) -> Result<MetricData> {
        self.numa_metrics
            .get(&(numa_id, name.to_string()))
            .map(|v| MetricData::now(*v))
            .ok_or_else(|| anyhow!("numa metric {} not found for numa {}", name, numa_id))
    }

    async fn get_container_metric(
        &self,
        pod_uid: &str,
        container_name: &str,
        name: &str,
        numa_id: Option<i32>,
    ) -> Result<MetricData> {
        let key = (
            pod_uid.to_string(),
            container_name.to_string(),
            name.to_string(),
            numa_id.unwrap_or(WHOLE_CONTAINER),
        );
        self.container_metrics
            .get(&key)
            .map(|v| MetricData::now(*v))
            .ok_or_else(|| {
                anyhow!(
                    "container metric {} not found for {}/{}",
                    name,
                    pod_uid,
                    container_name
                )
            })
    }
}

/// Static pod list for tests
#[derive(Default)]
pub struct FakePodFetcher {
    pods: std::sync::RwLock<Vec<PodInfo>>,
}

impl FakePodFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pods(&self, pods: Vec<PodInfo>) {
        *self.pods.write().unwrap() = pods;
    }
}

#[async_trait]
impl PodFetcher for FakePodFetcher {
    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        Ok(self.pods.read().unwrap().clone())
    }
}

/// Shared handle types used across the advisor
pub type MetricsFetcherRef = Arc<dyn MetricsFetcher>;
pub type PodFetcherRef = Arc<dyn PodFetcher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_fetcher_roundtrip() {
        let fetcher = FakeMetricsFetcher::new();
        fetcher.set_node_metric(names::MEM_SCALE_FACTOR_SYSTEM, 100.0);
        fetcher.set_numa_metric(0, names::MEM_FREE_NUMA, 4096.0);
        fetcher.set_container_metric("pod-1", "main", names::CPU_USAGE_CONTAINER, None, 2.5);

        assert_eq!(
            fetcher
                .get_node_metric(names::MEM_SCALE_FACTOR_SYSTEM)
                .await
                .unwrap()
                .value,
            100.0
        );
        assert_eq!(
            fetcher
                .get_numa_metric(0, names::MEM_FREE_NUMA)
                .await
                .unwrap()
                .value,
            4096.0
        );
        assert_eq!(
            fetcher
                .get_container_metric("pod-1", "main", names::CPU_USAGE_CONTAINER, None)
                .await
                .unwrap()
                .value,
            2.5
        );
    }

    #[tokio::test]
    async fn test_missing_metric_is_an_error() {
        let fetcher = FakeMetricsFetcher::new();
        assert!(fetcher.get_node_metric("nope").await.is_err());
        assert!(fetcher.get_numa_metric(3, names::MEM_TOTAL_NUMA).await.is_err());
    }

    #[tokio::test]
    async fn test_removed_metric_fails_again() {
        let fetcher = FakeMetricsFetcher::new();
        fetcher.set_numa_metric(1, names::MEM_TOTAL_NUMA, 1.0);
        fetcher.remove_numa_metric(1, names::MEM_TOTAL_NUMA);
        assert!(fetcher.get_numa_metric(1, names::MEM_TOTAL_NUMA).await.is_err());
    }
}
