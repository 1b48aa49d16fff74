//! End-to-end advisor scenarios over the public API

use advisor_lib::advisor::{CpuAdvisorConfig, CpuResourceAdvisor};
use advisor_lib::checkpoint::{CheckpointManager, CPU_CHECKPOINT_FILE, MEMORY_CHECKPOINT_FILE};
use advisor_lib::healthz::HealthRegistry;
use advisor_lib::machine::{CpuSet, MachineInfo};
use advisor_lib::memory::{MemoryHeadroomConfig, MemoryHeadroomPolicyName, MemoryResourceAdvisor};
use advisor_lib::metacache::MetaCache;
use advisor_lib::metric::{names, FakeMetricsFetcher};
use advisor_lib::models::{
    pools, ContainerInfo, ContainerType, QoSLevel, FAKED_NUMA_ID,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const NUMA_CPUS: u32 = 24;

fn machine(numas: i32) -> Arc<MachineInfo> {
    Arc::new(MachineInfo::uniform(numas, NUMA_CPUS, false))
}

fn reserve_pool(numas: &[i32], per_numa: u32) -> advisor_lib::models::PoolInfo {
    let mut pool = advisor_lib::models::PoolInfo::new(pools::RESERVE);
    for numa in numas {
        let base = *numa as u32 * NUMA_CPUS;
        pool.topology_aware_assignments
            .insert(*numa, CpuSet::from_range(base, base + per_numa));
    }
    pool
}

fn container(uid: &str, pool: &str, qos: QoSLevel, request: f64) -> ContainerInfo {
    ContainerInfo {
        pod_uid: uid.to_string(),
        pod_name: format!("pod-{}", uid),
        pod_namespace: "default".to_string(),
        container_name: "main".to_string(),
        container_type: ContainerType::Main,
        qos_level: qos,
        owner_pool_name: pool.to_string(),
        origin_owner_pool_name: pool.to_string(),
        topology_aware_assignments: BTreeMap::new(),
        cpu_request: request,
        cpu_limit: request * 2.0,
        memory_request: 0.0,
        numa_binding: false,
        isolated: false,
        ramp_up: false,
        region_names: Vec::new(),
    }
}

fn advisor(
    config: CpuAdvisorConfig,
    machine: Arc<MachineInfo>,
    cache: Arc<MetaCache>,
) -> CpuResourceAdvisor {
    CpuResourceAdvisor::new(
        config,
        machine,
        cache,
        Arc::new(FakeMetricsFetcher::new()),
        HealthRegistry::new(),
    )
}

/// A mixed node: a dedicated NUMA-exclusive pod, two share pools, and a
/// force-isolated pool. Checks the budget and reclaim-floor properties.
#[tokio::test]
async fn test_mixed_node_budget_and_reclaim_floor() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MetaCache::new());
    cache.set_pool_info(reserve_pool(&[0, 1], 2));

    let mut dedicated = container("d", pools::DEDICATED, QoSLevel::Dedicated, 20.0);
    dedicated.numa_binding = true;
    dedicated
        .topology_aware_assignments
        .insert(1, CpuSet::from_range(24, 48));
    cache.set_container(dedicated);
    cache.set_container(container("a", "share-a", QoSLevel::Shared, 9.0));
    cache.set_container(container("b", "share-b", QoSLevel::Shared, 5.0));
    cache.set_container(container("hot", "share-hot", QoSLevel::Shared, 3.0));

    let mut config = CpuAdvisorConfig {
        data_dir: dir.path().to_path_buf(),
        reserved_for_reclaim_cpus: 4,
        ..Default::default()
    };
    config.isolation_force_enable_pools.insert("share-hot".to_string());

    let advisor = advisor(config, machine(2), cache);
    let result = advisor.update_and_get_advice().await.unwrap();

    // non-binding collective lives on numa 0 (22 cpus available)
    let share_a = result.pool_entry("share-a", FAKED_NUMA_ID).unwrap().size;
    let share_b = result.pool_entry("share-b", FAKED_NUMA_ID).unwrap().size;
    let isolation = result.pool_entry("isolation-hot", FAKED_NUMA_ID).unwrap().size;
    assert!(share_a + share_b + isolation <= 22);

    // reclaim floor per numa: 4 cpus split over 2 numas -> 2 each
    assert!(result.pool_entry(pools::RECLAIM, FAKED_NUMA_ID).unwrap().size >= 2);
    assert!(result.pool_entry(pools::RECLAIM, 1).unwrap().size >= 2);

    // dedicated numa 1: available 22, requirement 20
    assert_eq!(result.pool_entry(pools::RECLAIM, 1).unwrap().size, 2);
}

/// Identical inputs produce identical outputs across process "restarts"
/// (fresh advisor instances over the same container state).
#[tokio::test]
async fn test_restart_determinism() {
    let run = || async {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MetaCache::new());
        cache.set_pool_info(reserve_pool(&[0, 1], 2));
        cache.set_container(container("a", "share-a", QoSLevel::Shared, 9.3));
        cache.set_container(container("b", "share-b", QoSLevel::Shared, 6.7));
        cache.set_container(container("c", "share-b", QoSLevel::Shared, 1.2));

        let config = CpuAdvisorConfig {
            data_dir: dir.path().to_path_buf(),
            reserved_for_reclaim_cpus: 4,
            ..Default::default()
        };
        let advisor = advisor(config, machine(2), cache);
        let result = advisor.update_and_get_advice().await.unwrap();
        (result.pool_entries, result.pool_overlap_info)
    };

    assert_eq!(run().await, run().await);
}

/// Memory headroom: the full numbers of the reference scenario, driven
/// through the memory advisor including its checkpoint.
#[tokio::test]
async fn test_memory_advisor_scenario_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cache = MetaCache::new();

    let fetcher = Arc::new(FakeMetricsFetcher::new());
    for numa in [0, 1] {
        fetcher.set_numa_metric(numa, names::MEM_FREE_NUMA, 4.0 * GIB);
        fetcher.set_numa_metric(numa, names::MEM_INACTIVE_FILE_NUMA, 10.0 * GIB);
        fetcher.set_numa_metric(numa, names::MEM_TOTAL_NUMA, 32.0 * GIB);
    }
    fetcher.set_node_metric(names::MEM_SCALE_FACTOR_SYSTEM, 100.0);

    let mut advisor = MemoryResourceAdvisor::new(
        MemoryHeadroomPolicyName::NumaAware,
        MemoryHeadroomConfig {
            cache_based_ratio: 0.5,
            reserved_for_allocate_bytes: 2.0 * GIB,
        },
        machine(2),
        fetcher,
        dir.path(),
        HealthRegistry::new(),
    );

    advisor.update(&cache).await.unwrap();
    let (total, per_numa) = advisor.get_headroom().unwrap();
    assert!((total - 15.36 * GIB).abs() < 1e6);
    assert!((per_numa[&0] as f64 - 7.68 * GIB).abs() < 1e6);
    assert!((per_numa[&1] as f64 - 7.68 * GIB).abs() < 1e6);

    // the checkpoint round-trips the published headroom
    let manager = CheckpointManager::new(dir.path(), MEMORY_CHECKPOINT_FILE);
    let checkpoint = manager.load().unwrap().unwrap();
    assert_eq!(checkpoint.numa_headroom, per_numa);
}

/// A corrupted cpu checkpoint degrades to an empty start
#[tokio::test]
async fn test_corrupt_cpu_checkpoint_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MetaCache::new());
    cache.set_pool_info(reserve_pool(&[0], 2));
    cache.set_container(container("a", "share-a", QoSLevel::Shared, 10.0));

    let config = CpuAdvisorConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let first = advisor(config.clone(), machine(1), cache.clone());
    first.update_and_get_advice().await.unwrap();

    // flip payload bytes in the persisted checkpoint
    let manager = CheckpointManager::new(dir.path(), CPU_CHECKPOINT_FILE);
    let text = std::fs::read_to_string(manager.path()).unwrap();
    std::fs::write(manager.path(), text.replacen("share-a", "share-b", 1)).unwrap();

    let second = advisor(config, machine(1), cache);
    second.recover().await;
    assert!(second.get_provision_result().await.is_none());
}

/// Overcommitted share pools shrink proportionally and keep the floor
#[tokio::test]
async fn test_overcommit_shrinks_and_keeps_floor() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MetaCache::new());
    cache.set_pool_info(reserve_pool(&[0], 2));
    cache.set_container(container("a", "share-a", QoSLevel::Shared, 14.0));
    cache.set_container(container("b", "share-b", QoSLevel::Shared, 12.0));

    let config = CpuAdvisorConfig {
        data_dir: dir.path().to_path_buf(),
        reserved_for_reclaim_cpus: 4,
        ..Default::default()
    };
    let advisor = advisor(config, machine(1), cache);
    let result = advisor.update_and_get_advice().await.unwrap();

    assert_eq!(result.pool_entry("share-a", FAKED_NUMA_ID).unwrap().size, 12);
    assert_eq!(result.pool_entry("share-b", FAKED_NUMA_ID).unwrap().size, 10);
    assert_eq!(result.pool_entry(pools::RECLAIM, FAKED_NUMA_ID).unwrap().size, 4);
}
