//! Memory headroom advisor
//!
//! Computes how much memory can be lent to reclaimed workloads, per NUMA
//! node: free memory plus a configurable share of the inactive file cache,
//! minus the kswapd watermark reserve and the allocation reservation. The
//! result is only served after a successful update.

use crate::checkpoint::{Checkpoint, CheckpointManager, MEMORY_CHECKPOINT_FILE};
use crate::healthz::{checks, HealthRegistry};
use crate::machine::MachineInfo;
use crate::metacache::MetaCache;
use crate::metric::{names, MetricsFetcherRef};
use crate::models::{PolicyUpdateStatus, QoSLevel};
use crate::observability::AdvisorMetrics;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryHeadroomPolicyName {
    None,
    NumaAware,
}

#[derive(Debug, Clone)]
pub struct MemoryHeadroomConfig {
    /// Share of the inactive file cache counted as reclaimable, in [0, 1]
    pub cache_based_ratio: f64,
    /// Memory reserved for regular allocation, spread evenly across NUMAs
    pub reserved_for_allocate_bytes: f64,
}

impl Default for MemoryHeadroomConfig {
    fn default() -> Self {
        Self {
            cache_based_ratio: 0.5,
            reserved_for_allocate_bytes: 0.0,
        }
    }
}

/// NUMA-aware reclaimable memory calculator
pub struct PolicyNumaAware {
    config: MemoryHeadroomConfig,
    machine: Arc<MachineInfo>,
    metrics: MetricsFetcherRef,
    memory_headroom: f64,
    numa_headroom: BTreeMap<i32, i64>,
    update_status: PolicyUpdateStatus,
}

impl PolicyNumaAware {
    pub fn new(
        config: MemoryHeadroomConfig,
        machine: Arc<MachineInfo>,
        metrics: MetricsFetcherRef,
    ) -> Self {
        Self {
            config,
            machine,
            metrics,
            memory_headroom: 0.0,
            numa_headroom: BTreeMap::new(),
            update_status: PolicyUpdateStatus::Failed,
        }
    }

    /// NUMAs not claimed exclusively by dedicated containers, plus the
    /// reclaimed-cores containers assigned to them
    fn available_numas_and_reclaimed(
        &self,
        cache: &MetaCache,
    ) -> (BTreeSet<i32>, Vec<(f64, Vec<i32>)>) {
        let mut available = self.machine.numa_nodes();
        let mut reclaimed = Vec::new();
        cache.range_container(|ci| {
            if ci.is_dedicated_numa_exclusive() {
                for numa in ci.topology_aware_assignments.keys() {
                    available.remove(numa);
                }
            } else if ci.qos_level == QoSLevel::Reclaimed {
                reclaimed.push((
                    ci.memory_request,
                    ci.topology_aware_assignments.keys().copied().collect(),
                ));
            }
            true
        });
        (available, reclaimed)
    }

    pub async fn update(&mut self, cache: &MetaCache) -> Result<()> {
        match self.try_update(cache).await {
            Ok(()) => {
                self.update_status = PolicyUpdateStatus::Succeeded;
                Ok(())
            }
            Err(e) => {
                self.update_status = PolicyUpdateStatus::Failed;
                Err(e)
            }
        }
    }

    async fn try_update(&mut self, cache: &MetaCache) -> Result<()> {
        let (available_numas, reclaimed_containers) = self.available_numas_and_reclaimed(cache);

        let mut reclaimable_memory = 0.0;
        let mut numa_reclaimable: BTreeMap<i32, f64> = BTreeMap::new();
        let mut avail_numa_total = 0.0;
        let mut reserved_for_allocate = 0.0;
        let num_numas = self.machine.num_numa_nodes().max(1) as f64;

        for numa_id in &available_numas {
            let free = self
                .metrics
                .get_numa_metric(*numa_id, names::MEM_FREE_NUMA)
                .await
                .with_context(|| format!("free memory unavailable for numa {}", numa_id))?
                .value;
            let inactive_file = self
                .metrics
                .get_numa_metric(*numa_id, names::MEM_INACTIVE_FILE_NUMA)
                .await
                .with_context(|| format!("inactive file unavailable for numa {}", numa_id))?
                .value;
            let total = self
                .metrics
                .get_numa_metric(*numa_id, names::MEM_TOTAL_NUMA)
                .await
                .with_context(|| format!("total memory unavailable for numa {}", numa_id))?
                .value;

            avail_numa_total += total;
            reserved_for_allocate += self.config.reserved_for_allocate_bytes / num_numas;

            let numa_reclaim = free + inactive_file * self.config.cache_based_ratio;
            debug!(
                numa = numa_id,
                free, inactive_file, total, numa_reclaim, "numa memory info"
            );

            reclaimable_memory += numa_reclaim;
            numa_reclaimable.insert(*numa_id, numa_reclaim);
        }

        // memory already granted to reclaimed containers counts as
        // reclaimable on their NUMAs
        for (memory_request, numas) in &reclaimed_containers {
            reclaimable_memory += memory_request;
            if *memory_request > 0.0 && !numas.is_empty() {
                let per_numa = memory_request / numas.len() as f64;
                for numa in numas {
                    *numa_reclaimable.entry(*numa).or_default() += per_numa;
                }
            }
        }

        let scale_factor = self
            .metrics
            .get_node_metric(names::MEM_SCALE_FACTOR_SYSTEM)
            .await
            .context("watermark scale factor unavailable")?
            .value;

        // keep kswapd quiet: hold back the watermark-scaled share of total
        let watermark_reserved = avail_numa_total * scale_factor / 10_000.0;

        self.memory_headroom =
            (reclaimable_memory - watermark_reserved - reserved_for_allocate).max(0.0);
        let reduce_ratio = if reclaimable_memory > 0.0 {
            self.memory_headroom / reclaimable_memory
        } else {
            0.0
        };

        let mut numa_headroom = BTreeMap::new();
        for (numa_id, reclaim) in &numa_reclaimable {
            numa_headroom.insert(*numa_id, (reclaim * reduce_ratio) as i64);
        }
        for numa_id in self.machine.numa_nodes() {
            numa_headroom.entry(numa_id).or_insert(0);
        }
        self.numa_headroom = numa_headroom;

        info!(
            reclaimable = reclaimable_memory,
            watermark_reserved,
            reserved_for_allocate,
            headroom = self.memory_headroom,
            "memory headroom updated"
        );
        Ok(())
    }

    /// Refuses to serve until the next successful update
    pub fn get_headroom(&self) -> Result<(f64, BTreeMap<i32, i64>)> {
        if self.update_status != PolicyUpdateStatus::Succeeded {
            bail!("last memory headroom update failed");
        }
        Ok((self.memory_headroom, self.numa_headroom.clone()))
    }
}

/// The memory advisor: one policy, a checkpoint, a heartbeat
pub struct MemoryResourceAdvisor {
    policy: PolicyNumaAware,
    policy_name: MemoryHeadroomPolicyName,
    checkpoint_manager: CheckpointManager,
    health: HealthRegistry,
    metrics_out: AdvisorMetrics,
}

impl MemoryResourceAdvisor {
    pub fn new(
        policy_name: MemoryHeadroomPolicyName,
        config: MemoryHeadroomConfig,
        machine: Arc<MachineInfo>,
        metrics: MetricsFetcherRef,
        data_dir: impl AsRef<std::path::Path>,
        health: HealthRegistry,
    ) -> Self {
        Self {
            policy: PolicyNumaAware::new(config, machine, metrics),
            policy_name,
            checkpoint_manager: CheckpointManager::new(data_dir, MEMORY_CHECKPOINT_FILE),
            health,
            metrics_out: AdvisorMetrics::new(),
        }
    }

    /// One tick: update the policy, publish metrics, checkpoint
    pub async fn update(&mut self, cache: &MetaCache) -> Result<()> {
        let result = match self.policy_name {
            MemoryHeadroomPolicyName::None => Ok(()),
            MemoryHeadroomPolicyName::NumaAware => self.policy.update(cache).await,
        };
        self.health
            .update_by_error(checks::MEMORY_ADVISOR_UPDATE, result.as_ref().err())
            .await;
        result?;

        if let Ok((_, numa_headroom)) = self.policy.get_headroom() {
            for (numa_id, bytes) in &numa_headroom {
                self.metrics_out.record_memory_headroom(*numa_id, *bytes as f64);
            }
            let mut checkpoint = Checkpoint::new("numa_aware");
            checkpoint.numa_headroom = numa_headroom;
            self.checkpoint_manager
                .save(&mut checkpoint)
                .context("memory checkpoint persist failed")?;
        }
        Ok(())
    }

    pub fn get_headroom(&self) -> Result<(f64, BTreeMap<i32, i64>)> {
        match self.policy_name {
            MemoryHeadroomPolicyName::None => Ok((0.0, BTreeMap::new())),
            MemoryHeadroomPolicyName::NumaAware => self.policy.get_headroom(),
        }
    }
}
