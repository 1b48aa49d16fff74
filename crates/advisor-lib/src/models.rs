//! Core data model shared by the advisor components

use crate::machine::CpuSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel NUMA id meaning "no NUMA preference" in calculation results
pub const FAKED_NUMA_ID: i32 = -1;

/// Well-known pool names consumed by the enforcement layer
pub mod pools {
    pub const RESERVE: &str = "reserve";
    pub const RECLAIM: &str = "reclaim";
    pub const DEDICATED: &str = "dedicated";
    pub const SHARE: &str = "share";

    /// Pool type label for metrics, derived from the pool name
    pub fn pool_type(name: &str) -> &'static str {
        match name {
            RESERVE => "reserve",
            RECLAIM => "reclaim",
            DEDICATED => "dedicated",
            _ if name.starts_with("isolation") => "isolation",
            _ => "share",
        }
    }
}

/// QoS level assigned to a workload by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QoSLevel {
    /// Exclusive cores, usually NUMA bound
    Dedicated,
    /// Co-scheduled on shared pools
    Shared,
    /// Opportunistic workloads running on lent headroom
    Reclaimed,
    /// Node system components
    System,
}

/// Whether a container is the workload itself or an auxiliary sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Main,
    Sidecar,
}

/// Per-container state tracked by the meta-cache.
///
/// `owner_pool_name` is the pool the container currently runs in;
/// `origin_owner_pool_name` is the pool it was admitted to, which survives
/// temporary moves such as isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub pod_uid: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
    pub container_type: ContainerType,
    pub qos_level: QoSLevel,
    pub owner_pool_name: String,
    pub origin_owner_pool_name: String,
    /// NUMA id -> assigned cpus; dedicated NUMA-binding containers have
    /// exactly one entry
    pub topology_aware_assignments: BTreeMap<i32, CpuSet>,
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request: f64,
    /// Requested NUMA binding (annotation driven)
    pub numa_binding: bool,
    /// Set by the advisor each tick from the isolator verdict
    pub isolated: bool,
    /// True until the enforcement layer has admitted the container to a pool
    pub ramp_up: bool,
    /// Names of the regions this container currently belongs to
    pub region_names: Vec<String>,
}

impl ContainerInfo {
    pub fn is_numa_binding(&self) -> bool {
        self.numa_binding
    }

    /// Dedicated container pinned to exclusive NUMA nodes
    pub fn is_dedicated_numa_exclusive(&self) -> bool {
        self.qos_level == QoSLevel::Dedicated && self.numa_binding
    }
}

/// A named cpu pool with per-NUMA assignments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pool_name: String,
    pub topology_aware_assignments: BTreeMap<i32, CpuSet>,
    pub region_names: Vec<String>,
}

impl PoolInfo {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            ..Default::default()
        }
    }

    /// Total cpus across all NUMA nodes
    pub fn pool_size(&self) -> u32 {
        self.topology_aware_assignments
            .values()
            .map(|c| c.size() as u32)
            .sum()
    }

    /// Cpus assigned on a single NUMA node
    pub fn size_on_numa(&self, numa_id: i32) -> u32 {
        self.topology_aware_assignments
            .get(&numa_id)
            .map(|c| c.size() as u32)
            .unwrap_or(0)
    }
}

/// Region classification; decides which policies run and how the assembler
/// treats the region's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionType {
    Share,
    DedicatedNumaExclusive,
    Isolation,
}

impl RegionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionType::Share => "share",
            RegionType::DedicatedNumaExclusive => "dedicated_numa_exclusive",
            RegionType::Isolation => "isolation",
        }
    }
}

/// Knob names a provision policy may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControlKnobName {
    NonReclaimedCpuRequirement,
    NonReclaimedCpuRequirementUpper,
    NonReclaimedCpuRequirementLower,
    ReclaimedCpuQuota,
}

/// Output of a provision policy: knob name -> value
pub type ControlKnob = BTreeMap<ControlKnobName, f64>;

/// The envelope within which any policy must produce its knob
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceEssentials {
    pub enable_reclaim: bool,
    pub resource_upper_bound: f64,
    pub resource_lower_bound: f64,
    pub reserved_for_reclaim: f64,
    pub reserved_for_allocate: f64,
    pub allow_shared_cores_overlap_reclaimed_cores: bool,
}

/// An observed/target pair for one control indicator
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Indicator {
    pub current: f64,
    pub target: f64,
}

/// Indicator vector refreshed from metrics before the provision policy runs
#[derive(Debug, Clone, Default)]
pub struct ControlEssentials {
    pub indicators: BTreeMap<String, Indicator>,
}

/// Whether the last policy update round succeeded; outputs of a failed
/// policy are withheld until the next success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyUpdateStatus {
    Succeeded,
    Failed,
}

/// One pool entry in the calculation result. A negative quota means the
/// pool is not quota-limited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuResource {
    pub size: u32,
    pub quota: f64,
}

impl CpuResource {
    pub fn sized(size: u32) -> Self {
        Self { size, quota: -1.0 }
    }

    pub fn with_quota(size: u32, quota: f64) -> Self {
        Self { size, quota }
    }
}

/// The per-tick allocation decision published to the enforcement layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuCalculationResult {
    /// pool name -> numa id -> allocation
    pub pool_entries: BTreeMap<String, BTreeMap<i32, CpuResource>>,
    /// pool name -> numa id -> overlapped pool name -> overlap size
    pub pool_overlap_info: BTreeMap<String, BTreeMap<i32, BTreeMap<String, u32>>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub allow_shared_cores_overlap_reclaimed_cores: bool,
}

impl CpuCalculationResult {
    pub fn new(allow_overlap: bool) -> Self {
        Self {
            pool_entries: BTreeMap::new(),
            pool_overlap_info: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
            allow_shared_cores_overlap_reclaimed_cores: allow_overlap,
        }
    }

    pub fn set_pool_entry(&mut self, pool: &str, numa_id: i32, resource: CpuResource) {
        self.pool_entries
            .entry(pool.to_string())
            .or_default()
            .insert(numa_id, resource);
    }

    pub fn set_pool_overlap_info(&mut self, pool: &str, numa_id: i32, overlapped: &str, size: u32) {
        self.pool_overlap_info
            .entry(pool.to_string())
            .or_default()
            .entry(numa_id)
            .or_default()
            .insert(overlapped.to_string(), size);
    }

    pub fn pool_entry(&self, pool: &str, numa_id: i32) -> Option<CpuResource> {
        self.pool_entries.get(pool).and_then(|m| m.get(&numa_id)).copied()
    }

    /// Total size of a pool across all NUMA entries
    pub fn pool_size(&self, pool: &str) -> u32 {
        self.pool_entries
            .get(pool)
            .map(|m| m.values().map(|r| r.size).sum())
            .unwrap_or(0)
    }
}

/// Pod descriptor returned by the pod fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}
