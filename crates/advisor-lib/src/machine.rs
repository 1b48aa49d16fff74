//! Node topology: NUMA layout and cgroup hierarchy detection

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// An ordered set of cpu ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_range(start: u32, end: u32) -> Self {
        Self((start..end).collect())
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0.contains(&cpu)
    }

    pub fn insert(&mut self, cpu: u32) {
        self.0.insert(cpu);
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.difference(&other.0).copied().collect())
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An ordered set of NUMA node ids
pub type NumaSet = BTreeSet<i32>;

/// Static NUMA topology of the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    /// NUMA id -> cpus on that node
    numa_to_cpus: BTreeMap<i32, CpuSet>,
    /// Cgroup v2 unified hierarchy in use
    pub cgroup_v2_unified: bool,
}

impl MachineInfo {
    pub fn new(numa_to_cpus: BTreeMap<i32, CpuSet>, cgroup_v2_unified: bool) -> Self {
        Self {
            numa_to_cpus,
            cgroup_v2_unified,
        }
    }

    /// Uniform topology helper: `num_numas` nodes with `cpus_per_numa` cpus each
    pub fn uniform(num_numas: i32, cpus_per_numa: u32, cgroup_v2_unified: bool) -> Self {
        let numa_to_cpus = (0..num_numas)
            .map(|id| {
                let base = id as u32 * cpus_per_numa;
                (id, CpuSet::from_range(base, base + cpus_per_numa))
            })
            .collect();
        Self::new(numa_to_cpus, cgroup_v2_unified)
    }

    pub fn numa_nodes(&self) -> NumaSet {
        self.numa_to_cpus.keys().copied().collect()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.numa_to_cpus.len()
    }

    pub fn numa_to_cpus(&self, numa_id: i32) -> CpuSet {
        self.numa_to_cpus.get(&numa_id).cloned().unwrap_or_default()
    }

    pub fn numa_capacity(&self, numa_id: i32) -> u32 {
        self.numa_to_cpus
            .get(&numa_id)
            .map(|c| c.size() as u32)
            .unwrap_or(0)
    }

    /// Total cpus across the given NUMA nodes
    pub fn cpu_size_in_numas(&self, numas: &NumaSet) -> u32 {
        numas.iter().map(|id| self.numa_capacity(*id)).sum()
    }

    /// Socket topology description for checkpointing, NUMA id -> cpu list
    pub fn socket_topology(&self) -> BTreeMap<i32, String> {
        self.numa_to_cpus
            .iter()
            .map(|(id, cpus)| {
                let list: Vec<String> = cpus.iter().map(|c| c.to_string()).collect();
                (*id, list.join(","))
            })
            .collect()
    }
}

/// Detected cgroup hierarchy version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

/// Detect the cgroup version from the mounted hierarchy. The unified
/// hierarchy exposes `cgroup.controllers` at the mount root.
pub fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    if cgroup_root.join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else if cgroup_root.join("cpu").exists() || cgroup_root.join("memory").exists() {
        CgroupVersion::V1
    } else {
        CgroupVersion::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_topology() {
        let machine = MachineInfo::uniform(2, 24, false);
        assert_eq!(machine.num_numa_nodes(), 2);
        assert_eq!(machine.numa_capacity(0), 24);
        assert_eq!(machine.numa_capacity(1), 24);
        assert!(machine.numa_to_cpus(1).contains(24));
        assert!(!machine.numa_to_cpus(0).contains(24));
    }

    #[test]
    fn test_cpu_size_in_numas() {
        let machine = MachineInfo::uniform(4, 16, false);
        let numas: NumaSet = [0, 2].into_iter().collect();
        assert_eq!(machine.cpu_size_in_numas(&numas), 32);
        assert_eq!(machine.cpu_size_in_numas(&NumaSet::new()), 0);
    }

    #[test]
    fn test_cpuset_operations() {
        let a = CpuSet::from_range(0, 4);
        let b = CpuSet::from_range(2, 6);
        assert_eq!(a.union(&b).size(), 6);
        assert_eq!(a.difference(&b).size(), 2);
    }

    #[test]
    fn test_detect_cgroup_version() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_cgroup_version(dir.path()), CgroupVersion::Unknown);

        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        assert_eq!(detect_cgroup_version(dir.path()), CgroupVersion::V2);
    }
}
