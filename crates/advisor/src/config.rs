//! Advisor daemon configuration

use advisor_lib::isolation::IsolationConfig;
use advisor_lib::memory::{MemoryHeadroomConfig, MemoryHeadroomPolicyName};
use advisor_lib::region::headroom::HeadroomPolicyName;
use advisor_lib::region::provision::{ProvisionPolicyName, RamaConfig};
use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    /// Node name from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_sync_period")]
    pub sync_period_secs: u64,

    /// NUMA layout; topology introspection is injected, not probed
    #[serde(default = "default_numa_nodes")]
    pub numa_nodes: i32,
    #[serde(default = "default_cpus_per_numa")]
    pub cpus_per_numa: u32,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    #[serde(default = "default_pod_resources_socket")]
    pub pod_resources_socket: PathBuf,

    #[serde(default = "default_kubelet_config_endpoint")]
    pub kubelet_config_endpoint: String,
    #[serde(default)]
    pub use_kubelet_reserved_config: bool,
    #[serde(default = "default_reserved_memory_gb")]
    pub reserved_memory_gb: f64,

    #[serde(default = "default_true")]
    pub enable_reclaim: bool,
    #[serde(default = "default_cache_based_ratio")]
    pub cache_based_ratio: f64,
    #[serde(default = "default_reserved_for_reclaim_cpus")]
    pub reserved_for_reclaim_cpus: u32,
    #[serde(default)]
    pub reserved_for_allocate_cpus: f64,
    #[serde(default)]
    pub allow_shared_cores_overlap_reclaimed_cores: bool,
    #[serde(default)]
    pub enable_share_cores_numa_binding: bool,

    #[serde(default)]
    pub isolation_force_enable_pools: BTreeSet<String>,
    #[serde(default)]
    pub isolation_non_exclusive_pools: BTreeSet<String>,
    #[serde(default)]
    pub isolation_disable_pools: BTreeSet<String>,
    #[serde(default = "default_isolation_load_ratio_threshold")]
    pub isolation_load_ratio_threshold: f64,
    #[serde(default = "default_isolation_min_duration")]
    pub isolation_min_duration_secs: u64,

    #[serde(default = "default_share_provision_policy")]
    pub share_provision_policy: ProvisionPolicyName,
    #[serde(default = "default_dedicated_provision_policy")]
    pub dedicated_provision_policy: ProvisionPolicyName,
    #[serde(default = "default_share_headroom_policy")]
    pub share_headroom_policy: HeadroomPolicyName,
    #[serde(default = "default_dedicated_headroom_policy")]
    pub dedicated_headroom_policy: HeadroomPolicyName,
    #[serde(default = "default_memory_headroom_policy")]
    pub memory_headroom_policy: MemoryHeadroomPolicyName,

    #[serde(default)]
    pub rama: RamaConfig,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/advisor")
}

fn default_sync_period() -> u64 {
    30
}

fn default_numa_nodes() -> i32 {
    1
}

fn default_cpus_per_numa() -> u32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_pod_resources_socket() -> PathBuf {
    PathBuf::from("/var/lib/kubelet/pod-resources/kubelet.sock")
}

fn default_kubelet_config_endpoint() -> String {
    "http://127.0.0.1:10255/configz".to_string()
}

fn default_reserved_memory_gb() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

fn default_cache_based_ratio() -> f64 {
    0.5
}

fn default_reserved_for_reclaim_cpus() -> u32 {
    4
}

fn default_isolation_load_ratio_threshold() -> f64 {
    1.5
}

fn default_isolation_min_duration() -> u64 {
    120
}

fn default_share_provision_policy() -> ProvisionPolicyName {
    ProvisionPolicyName::Canonical
}

fn default_dedicated_provision_policy() -> ProvisionPolicyName {
    ProvisionPolicyName::Canonical
}

fn default_share_headroom_policy() -> HeadroomPolicyName {
    HeadroomPolicyName::Canonical
}

fn default_dedicated_headroom_policy() -> HeadroomPolicyName {
    HeadroomPolicyName::NumaExclusive
}

fn default_memory_headroom_policy() -> MemoryHeadroomPolicyName {
    MemoryHeadroomPolicyName::NumaAware
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            sync_period_secs: default_sync_period(),
            numa_nodes: default_numa_nodes(),
            cpus_per_numa: default_cpus_per_numa(),
            cgroup_root: default_cgroup_root(),
            pod_resources_socket: default_pod_resources_socket(),
            kubelet_config_endpoint: default_kubelet_config_endpoint(),
            use_kubelet_reserved_config: false,
            reserved_memory_gb: default_reserved_memory_gb(),
            enable_reclaim: true,
            cache_based_ratio: default_cache_based_ratio(),
            reserved_for_reclaim_cpus: default_reserved_for_reclaim_cpus(),
            reserved_for_allocate_cpus: 0.0,
            allow_shared_cores_overlap_reclaimed_cores: false,
            enable_share_cores_numa_binding: false,
            isolation_force_enable_pools: BTreeSet::new(),
            isolation_non_exclusive_pools: BTreeSet::new(),
            isolation_disable_pools: BTreeSet::new(),
            isolation_load_ratio_threshold: default_isolation_load_ratio_threshold(),
            isolation_min_duration_secs: default_isolation_min_duration(),
            share_provision_policy: default_share_provision_policy(),
            dedicated_provision_policy: default_dedicated_provision_policy(),
            share_headroom_policy: default_share_headroom_policy(),
            dedicated_headroom_policy: default_dedicated_headroom_policy(),
            memory_headroom_policy: default_memory_headroom_policy(),
            rama: RamaConfig::default(),
        }
    }
}

impl AdvisorConfig {
    /// Load configuration from the environment (prefix `ADVISOR`)
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ADVISOR"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    pub fn cpu_advisor_config(&self) -> advisor_lib::CpuAdvisorConfig {
        advisor_lib::CpuAdvisorConfig {
            sync_period: Duration::from_secs(self.sync_period_secs),
            data_dir: self.data_dir.clone(),
            enable_reclaim: self.enable_reclaim,
            allow_shared_cores_overlap_reclaimed_cores: self
                .allow_shared_cores_overlap_reclaimed_cores,
            enable_share_cores_numa_binding: self.enable_share_cores_numa_binding,
            isolation: IsolationConfig {
                load_ratio_threshold: self.isolation_load_ratio_threshold,
                min_duration: Duration::from_secs(self.isolation_min_duration_secs),
                window: Duration::from_secs(self.isolation_min_duration_secs * 5),
                disable_pools: self.isolation_disable_pools.clone(),
            },
            isolation_force_enable_pools: self.isolation_force_enable_pools.clone(),
            isolation_non_exclusive_pools: self.isolation_non_exclusive_pools.clone(),
            reserved_for_reclaim_cpus: self.reserved_for_reclaim_cpus,
            reserved_for_allocate_cpus: self.reserved_for_allocate_cpus,
            share_provision_policy: self.share_provision_policy,
            dedicated_provision_policy: self.dedicated_provision_policy,
            share_headroom_policy: self.share_headroom_policy,
            dedicated_headroom_policy: self.dedicated_headroom_policy,
            rama: self.rama.clone(),
        }
    }

    /// The kubelet-reported memory reservation wins over the static
    /// `reserved_memory_gb` default when `use_kubelet_reserved_config` is on
    pub fn memory_headroom_config(
        &self,
        kubelet_reserved_memory_bytes: Option<u64>,
    ) -> MemoryHeadroomConfig {
        let reserved_for_allocate_bytes = match kubelet_reserved_memory_bytes {
            Some(bytes) if self.use_kubelet_reserved_config => bytes as f64,
            _ => self.reserved_memory_gb * 1024.0 * 1024.0 * 1024.0,
        };
        MemoryHeadroomConfig {
            cache_based_ratio: self.cache_based_ratio.clamp(0.0, 1.0),
            reserved_for_allocate_bytes,
        }
    }
}
