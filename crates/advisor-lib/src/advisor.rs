//! CPU resource advisor
//!
//! The periodic control loop: partition containers into QoS regions, run the
//! per-region provision and headroom policies, assemble the global pool
//! allocation, publish and checkpoint it. One tick at a time under a coarse
//! write lock; readers take the shared lock and see complete snapshots only.

use crate::assembler::{assemble_provision, AssemblerInputs, RegionSnapshot};
use crate::checkpoint::{Checkpoint, CheckpointManager, CPU_CHECKPOINT_FILE};
use crate::healthz::{checks, HealthRegistry};
use crate::isolation::{IsolationConfig, LoadIsolator};
use crate::machine::{MachineInfo, NumaSet};
use crate::metacache::MetaCache;
use crate::metric::MetricsFetcherRef;
use crate::models::{
    pools, ContainerInfo, CpuCalculationResult, PoolInfo, QoSLevel, RegionType,
    ResourceEssentials,
};
use crate::observability::AdvisorMetrics;
use crate::region::headroom::{new_headroom_policy, HeadroomPolicyName};
use crate::region::provision::{new_provision_policy, ProvisionPolicyName, RamaConfig};
use crate::region::Region;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Heartbeat toleration for the advisor tick
const HEALTH_CHECK_TOLERATION_SECS: i64 = 30;

/// Marker error for the single isolation-disabled retry
#[derive(Debug)]
struct IsolationSafetyCheckFailed;

impl std::fmt::Display for IsolationSafetyCheckFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "isolation safety check failed")
    }
}

impl std::error::Error for IsolationSafetyCheckFailed {}

#[derive(Debug, Clone)]
pub struct CpuAdvisorConfig {
    pub sync_period: Duration,
    pub data_dir: PathBuf,
    pub enable_reclaim: bool,
    pub allow_shared_cores_overlap_reclaimed_cores: bool,
    pub enable_share_cores_numa_binding: bool,
    pub isolation: IsolationConfig,
    pub isolation_force_enable_pools: BTreeSet<String>,
    pub isolation_non_exclusive_pools: BTreeSet<String>,
    /// Total cpus reserved for the reclaim pool, split across NUMA nodes
    pub reserved_for_reclaim_cpus: u32,
    pub reserved_for_allocate_cpus: f64,
    pub share_provision_policy: ProvisionPolicyName,
    pub dedicated_provision_policy: ProvisionPolicyName,
    pub share_headroom_policy: HeadroomPolicyName,
    pub dedicated_headroom_policy: HeadroomPolicyName,
    pub rama: RamaConfig,
}

impl Default for CpuAdvisorConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(30),
            data_dir: PathBuf::from("/var/lib/advisor"),
            enable_reclaim: true,
            allow_shared_cores_overlap_reclaimed_cores: false,
            enable_share_cores_numa_binding: false,
            isolation: IsolationConfig::default(),
            isolation_force_enable_pools: BTreeSet::new(),
            isolation_non_exclusive_pools: BTreeSet::new(),
            reserved_for_reclaim_cpus: 4,
            reserved_for_allocate_cpus: 0.0,
            share_provision_policy: ProvisionPolicyName::Canonical,
            dedicated_provision_policy: ProvisionPolicyName::Canonical,
            share_headroom_policy: HeadroomPolicyName::Canonical,
            dedicated_headroom_policy: HeadroomPolicyName::NumaExclusive,
            rama: RamaConfig::default(),
        }
    }
}

struct AdvisorState {
    region_map: BTreeMap<String, Region>,
    numa_available: BTreeMap<i32, u32>,
    reserved_for_reclaim: BTreeMap<i32, u32>,
    non_binding_numas: NumaSet,
    isolator: LoadIsolator,
    last_result: Option<CpuCalculationResult>,
    advisor_updated: bool,
}

pub struct CpuResourceAdvisor {
    config: CpuAdvisorConfig,
    machine: Arc<MachineInfo>,
    metacache: Arc<MetaCache>,
    metrics: MetricsFetcherRef,
    health: HealthRegistry,
    metrics_out: AdvisorMetrics,
    checkpoint_manager: CheckpointManager,
    state: RwLock<AdvisorState>,
}

impl CpuResourceAdvisor {
    pub fn new(
        config: CpuAdvisorConfig,
        machine: Arc<MachineInfo>,
        metacache: Arc<MetaCache>,
        metrics: MetricsFetcherRef,
        health: HealthRegistry,
    ) -> Self {
        let isolator = LoadIsolator::new(config.isolation.clone(), metrics.clone());
        let checkpoint_manager = CheckpointManager::new(&config.data_dir, CPU_CHECKPOINT_FILE);
        Self {
            config,
            machine,
            metacache,
            metrics,
            health,
            metrics_out: AdvisorMetrics::new(),
            checkpoint_manager,
            state: RwLock::new(AdvisorState {
                region_map: BTreeMap::new(),
                numa_available: BTreeMap::new(),
                reserved_for_reclaim: BTreeMap::new(),
                non_binding_numas: NumaSet::new(),
                isolator,
                last_result: None,
                advisor_updated: false,
            }),
        }
    }

    /// Restore the last published allocation, if a valid checkpoint exists
    pub async fn recover(&self) {
        let checkpoint = self.checkpoint_manager.load_or_empty("cpu_advisor");
        if checkpoint.machine_state.is_empty() {
            return;
        }
        let mut result = CpuCalculationResult::new(
            self.config.allow_shared_cores_overlap_reclaimed_cores,
        );
        for (numa_id, pool_entries) in &checkpoint.machine_state {
            for (pool, resource) in pool_entries {
                result.set_pool_entry(pool, *numa_id, *resource);
            }
        }
        let mut state = self.state.write().await;
        state.last_result = Some(result);
        info!("cpu advisor state recovered from checkpoint");
    }

    /// Drive ticks until the shutdown signal fires. Results are published on
    /// the returned channel after each successful tick.
    pub fn start(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> mpsc::Receiver<CpuCalculationResult> {
        let (result_tx, result_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            self.health
                .register_heartbeat_check(
                    checks::CPU_ADVISOR_UPDATE,
                    chrono::Duration::seconds(
                        self.config.sync_period.as_secs() as i64 * 2,
                    ),
                    crate::healthz::HealthCheckState::Ready,
                    chrono::Duration::seconds(HEALTH_CHECK_TOLERATION_SECS),
                )
                .await;

            let mut ticker = interval(self.config.sync_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // cancellation drops the in-flight tick before anything
                        // is published or checkpointed
                        tokio::select! {
                            result = self.update_and_get_advice() => {
                                if let Ok(result) = result {
                                    let _ = result_tx.send(result).await;
                                }
                            }
                            _ = shutdown.recv() => {
                                info!("shutting down cpu advisor mid-tick");
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("shutting down cpu advisor");
                        break;
                    }
                }
            }
        });
        result_rx
    }

    /// One tick: update everything and return the assembled result
    pub async fn update_and_get_advice(&self) -> Result<CpuCalculationResult> {
        let start = std::time::Instant::now();
        let result = self.update().await;
        self.health
            .update_by_error(checks::CPU_ADVISOR_UPDATE, result.as_ref().err())
            .await;
        let elapsed_ms = start.elapsed().as_millis() as f64;
        self.metrics_out.observe_update_duration_ms(elapsed_ms);
        if start.elapsed() > self.config.sync_period {
            warn!(elapsed_ms, "advisor tick overran its period");
        }
        result
    }

    async fn update(&self) -> Result<CpuCalculationResult> {
        let mut state = self.state.write().await;
        match self.update_with_isolation_guardian(&mut state, true).await {
            Err(e) if e.is::<IsolationSafetyCheckFailed>() => {
                warn!("isolation safety check failed, retrying with isolation disabled");
                self.update_with_isolation_guardian(&mut state, false).await
            }
            other => other,
        }
    }

    async fn update_with_isolation_guardian(
        &self,
        state: &mut AdvisorState,
        try_isolation: bool,
    ) -> Result<CpuCalculationResult> {
        // sanity check: the reserve pool must exist
        let reserve = self
            .metacache
            .get_pool_info(pools::RESERVE)
            .ok_or_else(|| anyhow!("reserve pool does not exist, skipping update"))?;

        self.update_numa_available(state, &reserve);
        let isolation_exists = self.set_isolated_containers(state, try_isolation).await;

        self.assign_containers_to_regions(state)
            .context("failed to assign containers to regions")?;
        Self::gc_region_map(state);
        self.update_advisor_essentials(state);

        // run a policy episode for each region
        for region in state.region_map.values_mut() {
            let binding = region.binding_numas().clone();
            let available: u32 = binding
                .iter()
                .map(|id| state.numa_available.get(id).copied().unwrap_or(0))
                .sum();
            let reserved_for_reclaim: u32 = binding
                .iter()
                .map(|id| state.reserved_for_reclaim.get(id).copied().unwrap_or(0))
                .sum();
            region.set_essentials(ResourceEssentials {
                enable_reclaim: self.config.enable_reclaim,
                resource_upper_bound: available as f64,
                resource_lower_bound: 0.0,
                reserved_for_reclaim: reserved_for_reclaim as f64,
                reserved_for_allocate: self.config.reserved_for_allocate_cpus
                    * binding.len() as f64
                    / self.machine.num_numa_nodes().max(1) as f64,
                allow_shared_cores_overlap_reclaimed_cores: self
                    .config
                    .allow_shared_cores_overlap_reclaimed_cores,
            });
            region.try_update_provision(&self.metrics).await;
            region.try_update_headroom(&self.metrics).await;
        }

        let inputs = self.snapshot_inputs(state, &reserve)?;
        let output = assemble_provision(&inputs).context("failed to assemble provision")?;

        for (region_name, throttled) in &output.throttled {
            if let Some(region) = state.region_map.get_mut(region_name) {
                region.set_throttled(*throttled);
            }
        }

        if try_isolation && isolation_exists && !self.check_isolation_safety(state, &output.result)
        {
            return Err(anyhow::Error::new(IsolationSafetyCheckFailed));
        }

        state.advisor_updated = true;
        state.last_result = Some(output.result.clone());

        self.emit_metrics(state, &output.result);
        if let Err(e) = self.persist_checkpoint(&output.result) {
            warn!(error = %e, "checkpoint persist failed");
        }

        Ok(output.result)
    }

    /// Per-NUMA availability: capacity minus the reserve-pool share. The
    /// reclaim floor is split evenly, at least one cpu per node.
    fn update_numa_available(&self, state: &mut AdvisorState, reserve: &PoolInfo) {
        let num_numas = self.machine.num_numa_nodes().max(1) as u32;
        let per_numa_reclaim = (self.config.reserved_for_reclaim_cpus / num_numas).max(1);
        state.numa_available.clear();
        state.reserved_for_reclaim.clear();
        for numa_id in self.machine.numa_nodes() {
            let capacity = self.machine.numa_capacity(numa_id);
            let reserved = reserve.size_on_numa(numa_id);
            state
                .numa_available
                .insert(numa_id, capacity.saturating_sub(reserved));
            state.reserved_for_reclaim.insert(numa_id, per_numa_reclaim);
        }
    }

    /// Ask the isolator and decorate containers with the verdict
    async fn set_isolated_containers(&self, state: &mut AdvisorState, enabled: bool) -> bool {
        let isolated = if enabled {
            state.isolator.get_isolated_pods(&self.metacache).await
        } else {
            BTreeSet::new()
        };
        if !isolated.is_empty() {
            info!(pods = ?isolated, "isolated pods this tick");
        }
        self.metacache.range_and_update_container(|ci| {
            ci.isolated = isolated.contains(&ci.pod_uid);
            true
        });
        !isolated.is_empty()
    }

    /// Rebuild region membership from scratch
    fn assign_containers_to_regions(&self, state: &mut AdvisorState) -> Result<()> {
        for region in state.region_map.values_mut() {
            region.clear();
        }

        let mut errors: Vec<String> = Vec::new();
        let mut assignments: Vec<(ContainerInfo, Vec<String>)> = Vec::new();
        self.metacache.range_container(|ci| {
            match self.assign_to_regions(state, ci) {
                Ok(Some(region_names)) => assignments.push((ci.clone(), region_names)),
                Ok(None) => {}
                Err(e) => errors.push(e.to_string()),
            }
            true
        });

        for (ci, region_names) in assignments {
            for name in &region_names {
                if let Some(region) = state.region_map.get_mut(name) {
                    if let Err(e) = region.add_container(&ci) {
                        errors.push(e.to_string());
                    }
                }
            }
            self.metacache
                .set_container_regions(&ci.pod_uid, &ci.container_name, region_names.clone());

            let skip_pool_bookkeeping = ci.owner_pool_name == pools::DEDICATED
                || ci.isolated
                || self
                    .config
                    .isolation_force_enable_pools
                    .contains(&ci.origin_owner_pool_name);
            if !skip_pool_bookkeeping && !ci.origin_owner_pool_name.is_empty() {
                if self
                    .metacache
                    .get_pool_info(&ci.origin_owner_pool_name)
                    .is_none()
                {
                    self.metacache
                        .set_pool_info(PoolInfo::new(&ci.origin_owner_pool_name));
                }
                if let Err(e) = self
                    .metacache
                    .set_pool_regions(&ci.origin_owner_pool_name, region_names)
                {
                    errors.push(e.to_string());
                }
            }
        }

        if !errors.is_empty() {
            bail!("region assignment errors: {}", errors.join("; "));
        }
        Ok(())
    }

    /// Region list for one container, creating regions on demand. `None`
    /// means the container gets no region this tick.
    fn assign_to_regions(
        &self,
        state: &mut AdvisorState,
        ci: &ContainerInfo,
    ) -> Result<Option<Vec<String>>> {
        match ci.qos_level {
            QoSLevel::Shared => self.assign_share_container(state, ci),
            QoSLevel::Dedicated if ci.is_numa_binding() => {
                self.assign_dedicated_container(state, ci)
            }
            _ => Ok(None),
        }
    }

    fn assign_share_container(
        &self,
        state: &mut AdvisorState,
        ci: &ContainerInfo,
    ) -> Result<Option<Vec<String>>> {
        let mut binding_numa = None;
        if self.config.enable_share_cores_numa_binding && ci.is_numa_binding() {
            if ci.owner_pool_name.is_empty() {
                bail!("empty owner pool name, {}/{}", ci.pod_uid, ci.container_name);
            }
            if ci.topology_aware_assignments.len() != 1 {
                bail!(
                    "invalid topology aware assignments of container {}/{}",
                    ci.pod_uid,
                    ci.container_name
                );
            }
            binding_numa = ci.topology_aware_assignments.keys().next().copied();
        } else {
            // a ramping-up container without an owner pool is not assignable yet
            if ci.ramp_up && ci.owner_pool_name.is_empty() {
                return Ok(None);
            }
            if ci.owner_pool_name.is_empty() && ci.cpu_request.abs() < f64::EPSILON {
                return Ok(None);
            }
            if ci.owner_pool_name.is_empty() {
                bail!("empty owner pool name, {}/{}", ci.pod_uid, ci.container_name);
            }
        }

        let forced = self
            .config
            .isolation_force_enable_pools
            .contains(&ci.origin_owner_pool_name);
        if ci.isolated || forced {
            return Ok(Some(self.isolation_region_for(state, ci, binding_numa)));
        }

        // reuse the share region keyed on the origin owner pool
        let existing = self
            .metacache
            .get_pool_regions(&ci.origin_owner_pool_name)
            .into_iter()
            .filter(|name| {
                state
                    .region_map
                    .get(name)
                    .map(|r| r.region_type() == RegionType::Share)
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        if !existing.is_empty() {
            return Ok(Some(existing));
        }

        let region = Region::share(
            &ci.origin_owner_pool_name,
            binding_numa,
            new_provision_policy(self.config.share_provision_policy, &self.config.rama),
            new_headroom_policy(self.config.share_headroom_policy),
        );
        let name = region.name().to_string();
        info!(region = %name, pod = %ci.pod_uid, "created share region");
        state.region_map.entry(name.clone()).or_insert(region);
        Ok(Some(vec![name]))
    }

    fn isolation_region_for(
        &self,
        state: &mut AdvisorState,
        ci: &ContainerInfo,
        binding_numa: Option<i32>,
    ) -> Vec<String> {
        let non_exclusive = self
            .config
            .isolation_non_exclusive_pools
            .contains(&ci.origin_owner_pool_name);
        let region_name = if non_exclusive {
            // all containers of this pool share one non-exclusive region
            ci.origin_owner_pool_name.clone()
        } else {
            format!("isolation-{}", ci.pod_uid)
        };

        if let Some(region) = state.region_map.get(&region_name) {
            if region.region_type() == RegionType::Isolation {
                return vec![region_name];
            }
        }

        let region = Region::isolation(
            &region_name,
            &ci.origin_owner_pool_name,
            binding_numa,
            new_provision_policy(ProvisionPolicyName::None, &self.config.rama),
            new_headroom_policy(HeadroomPolicyName::None),
        );
        info!(region = %region_name, pod = %ci.pod_uid, "created isolation region");
        state.region_map.insert(region_name.clone(), region);
        vec![region_name]
    }

    fn assign_dedicated_container(
        &self,
        state: &mut AdvisorState,
        ci: &ContainerInfo,
    ) -> Result<Option<Vec<String>>> {
        // reuse regions this container already holds
        let existing: Vec<String> = ci
            .region_names
            .iter()
            .filter(|name| {
                state
                    .region_map
                    .get(*name)
                    .map(|r| r.region_type() == RegionType::DedicatedNumaExclusive)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !existing.is_empty() {
            return Ok(Some(existing));
        }

        let mut names = Vec::new();
        for numa in ci.topology_aware_assignments.keys() {
            let region = Region::dedicated_numa_exclusive(
                &ci.pod_uid,
                *numa,
                new_provision_policy(self.config.dedicated_provision_policy, &self.config.rama),
                new_headroom_policy(self.config.dedicated_headroom_policy),
            );
            let name = region.name().to_string();
            state.region_map.entry(name.clone()).or_insert(region);
            names.push(name);
        }
        Ok(Some(names))
    }

    fn gc_region_map(state: &mut AdvisorState) {
        state.region_map.retain(|name, region| {
            if region.is_empty() {
                debug!(region = %name, "garbage collected empty region");
                false
            } else {
                true
            }
        });
    }

    /// Recompute the non-binding NUMA set and hand it to the non-binding
    /// share regions
    fn update_advisor_essentials(&self, state: &mut AdvisorState) {
        let mut non_binding = self.machine.numa_nodes();
        for region in state.region_map.values() {
            if !region.is_numa_binding() {
                continue;
            }
            match region.region_type() {
                RegionType::Share | RegionType::DedicatedNumaExclusive => {
                    for numa in region.binding_numas().iter() {
                        non_binding.remove(numa);
                    }
                }
                RegionType::Isolation => {}
            }
        }
        state.non_binding_numas = non_binding.clone();

        for region in state.region_map.values_mut() {
            if !region.is_numa_binding() {
                region.set_binding_numas(non_binding.clone());
            }
        }
    }

    fn snapshot_inputs(
        &self,
        state: &AdvisorState,
        reserve: &PoolInfo,
    ) -> Result<AssemblerInputs> {
        let mut regions = Vec::new();
        for region in state.region_map.values() {
            let control_knob = region
                .get_provision()
                .with_context(|| format!("no provision for region {}", region.name()))?;
            regions.push(RegionSnapshot {
                name: region.name().to_string(),
                region_type: region.region_type(),
                numa_binding: region.is_numa_binding(),
                binding_numas: region.binding_numas().clone(),
                owner_pool_name: region.owner_pool_name().to_string(),
                control_knob,
                pods_cpu_request: region.pods_cpu_request(),
            });
        }
        Ok(AssemblerInputs {
            regions,
            numa_available: state.numa_available.clone(),
            reserved_for_reclaim: state.reserved_for_reclaim.clone(),
            non_binding_numas: state.non_binding_numas.clone(),
            reserve_pool_size: reserve.pool_size(),
            enable_reclaim: self.config.enable_reclaim,
            allow_shared_cores_overlap_reclaimed_cores: self
                .config
                .allow_shared_cores_overlap_reclaimed_cores,
            cgroup_v2_unified: self.machine.cgroup_v2_unified,
        })
    }

    /// The non-binding collective must fit the non-binding NUMAs' capacity
    fn check_isolation_safety(
        &self,
        state: &AdvisorState,
        result: &CpuCalculationResult,
    ) -> bool {
        let mut share_and_isolation = 0u32;
        for (pool, entries) in &result.pool_entries {
            if pool == pools::RESERVE || pool == pools::RECLAIM {
                continue;
            }
            for (numa_id, resource) in entries {
                if *numa_id == crate::models::FAKED_NUMA_ID
                    || state.non_binding_numas.contains(numa_id)
                {
                    share_and_isolation += resource.size;
                }
            }
        }
        let capacity = self.machine.cpu_size_in_numas(&state.non_binding_numas);
        debug!(share_and_isolation, capacity, "isolation safety check");
        share_and_isolation <= capacity
    }

    fn emit_metrics(&self, state: &AdvisorState, result: &CpuCalculationResult) {
        self.metrics_out.record_pool_entries(result);
        for region in state.region_map.values() {
            self.metrics_out.record_region_status(
                region.name(),
                region.region_type().as_str(),
                region.is_throttled(),
            );
            for (indicator, value) in &region.control_essentials().indicators {
                self.metrics_out
                    .record_indicator(region.name(), indicator, value.target, value.current);
            }
        }
    }

    fn persist_checkpoint(&self, result: &CpuCalculationResult) -> Result<()> {
        let mut checkpoint = Checkpoint::new("cpu_advisor");
        for (pool, entries) in &result.pool_entries {
            for (numa_id, resource) in entries {
                checkpoint
                    .machine_state
                    .entry(*numa_id)
                    .or_default()
                    .insert(pool.clone(), *resource);
            }
        }
        if let Some(reclaim) = result.pool_entries.get(pools::RECLAIM) {
            for (numa_id, resource) in reclaim {
                checkpoint.numa_headroom.insert(*numa_id, resource.size as i64);
            }
        }
        self.metacache.range_container(|ci| {
            checkpoint
                .pod_resource_entries
                .entry(ci.pod_uid.clone())
                .or_default()
                .insert(ci.container_name.clone(), ci.owner_pool_name.clone());
            true
        });
        checkpoint.socket_topology = self.machine.socket_topology();
        self.checkpoint_manager.save(&mut checkpoint)
    }

    /// Last published result; readers never see a partial tick
    pub async fn get_provision_result(&self) -> Option<CpuCalculationResult> {
        self.state.read().await.last_result.clone()
    }

    /// Total and per-NUMA cpu headroom aggregated across regions
    pub async fn get_headroom(&self) -> Result<(f64, BTreeMap<i32, f64>)> {
        let state = self.state.read().await;
        if !state.advisor_updated {
            bail!("advisor not updated yet");
        }

        let mut total = 0.0;
        let mut per_numa: BTreeMap<i32, f64> = BTreeMap::new();
        let mut covered: NumaSet = NumaSet::new();
        for region in state.region_map.values() {
            let headroom = region
                .get_headroom()
                .with_context(|| format!("no headroom for region {}", region.name()))?;
            total += headroom;
            let numas = region.binding_numas();
            if !numas.is_empty() {
                let share = headroom / numas.len() as f64;
                for numa in numas.iter() {
                    *per_numa.entry(*numa).or_default() += share;
                    covered.insert(*numa);
                }
            }
        }
        // NUMAs with no region still lend their reclaim floor
        for (numa, reserved) in &state.reserved_for_reclaim {
            if !covered.contains(numa) {
                total += *reserved as f64;
                per_numa.insert(*numa, *reserved as f64);
            }
        }
        Ok((total, per_numa))
    }
}
