//! QoS resource advisor daemon
//!
//! Runs on each node next to the enforcement agent: decides cpu pool sizes
//! and reclaimable headroom every sync period and publishes the result.

use advisor_lib::healthz::HealthRegistry;
use advisor_lib::kubelet::{KubeletConfigClient, ReservedResources};
use advisor_lib::machine::{detect_cgroup_version, CgroupVersion, CpuSet, MachineInfo};
use advisor_lib::metric::{FakeMetricsFetcher, MetricsFetcherRef};
use advisor_lib::models::{pools, PoolInfo};
use advisor_lib::{AdvisorMetrics, CpuResourceAdvisor, MemoryResourceAdvisor, MetaCache};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const ADVISOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = ADVISOR_VERSION, "Starting resource advisor");

    let config = config::AdvisorConfig::load()?;
    info!(node_name = %config.node_name, "Advisor configured");

    let cgroup_v2 = detect_cgroup_version(&config.cgroup_root) == CgroupVersion::V2;
    let machine = Arc::new(MachineInfo::uniform(
        config.numa_nodes,
        config.cpus_per_numa,
        cgroup_v2,
    ));

    let health_registry = HealthRegistry::new();
    let _metrics = AdvisorMetrics::new();

    let metacache = Arc::new(MetaCache::new());

    // one kubelet fetch feeds both the cpu reserve pool and the memory
    // reservation
    let kubelet_reserved = if config.use_kubelet_reserved_config {
        fetch_kubelet_reserved(&config).await
    } else {
        None
    };
    seed_reserve_pool(&machine, &metacache, kubelet_reserved.as_ref());

    // the node metric agent is an injected collaborator; the in-memory
    // fetcher serves until one is wired in
    let metrics_fetcher: MetricsFetcherRef = Arc::new(FakeMetricsFetcher::new());

    let cpu_advisor = Arc::new(CpuResourceAdvisor::new(
        config.cpu_advisor_config(),
        machine.clone(),
        metacache.clone(),
        metrics_fetcher.clone(),
        health_registry.clone(),
    ));
    cpu_advisor.recover().await;

    let mut memory_advisor = MemoryResourceAdvisor::new(
        config.memory_headroom_policy,
        config.memory_headroom_config(kubelet_reserved.as_ref().map(|r| r.memory_bytes)),
        machine.clone(),
        metrics_fetcher.clone(),
        &config.data_dir,
        health_registry.clone(),
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let api_handle = tokio::spawn(api::serve(config.api_port, health_registry.clone()));

    // cpu advisor loop; results go to the enforcement layer
    let mut results = cpu_advisor.clone().start(shutdown_tx.subscribe());
    let publisher = tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            info!(
                pools = result.pool_entries.len(),
                timestamp = %result.timestamp,
                "cpu advice published"
            );
        }
    });

    // memory advisor loop
    let memory_cache = metacache.clone();
    let memory_period = Duration::from_secs(config.sync_period_secs);
    let mut memory_shutdown = shutdown_tx.subscribe();
    let memory_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(memory_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = memory_advisor.update(&memory_cache).await {
                        warn!(error = %e, "memory advisor update failed");
                    }
                }
                _ = memory_shutdown.recv() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    let _ = shutdown_tx.send(());

    let _ = memory_handle.await;
    publisher.abort();
    api_handle.abort();

    Ok(())
}

async fn fetch_kubelet_reserved(config: &config::AdvisorConfig) -> Option<ReservedResources> {
    match KubeletConfigClient::new(&config.kubelet_config_endpoint) {
        Ok(client) => match client.get_reserved().await {
            Ok(reserved) => Some(reserved),
            Err(e) => {
                warn!(error = %e, "kubelet reserved config unavailable");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "kubelet config client construction failed");
            None
        }
    }
}

/// Size the reserve pool from the kubelet's reserved cpus; the enforcement
/// layer refines the exact cpu assignment later.
fn seed_reserve_pool(
    machine: &Arc<MachineInfo>,
    metacache: &Arc<MetaCache>,
    reserved: Option<&ReservedResources>,
) {
    let Some(reserved) = reserved else {
        return;
    };
    let reserved_cpus = reserved.cpu_cores.ceil() as u32;
    if reserved_cpus == 0 {
        return;
    }

    // spread the reserve across NUMA nodes, low cpu ids first
    let num_numas = machine.num_numa_nodes().max(1) as u32;
    let per_numa = reserved_cpus.div_ceil(num_numas);
    let mut pool = PoolInfo::new(pools::RESERVE);
    for numa_id in machine.numa_nodes() {
        let cpus: CpuSet = machine.numa_to_cpus(numa_id).iter().take(per_numa as usize).collect();
        pool.topology_aware_assignments.insert(numa_id, cpus);
    }
    info!(reserved_cpus, "reserve pool seeded from kubelet config");
    metacache.set_pool_info(pool);
}
