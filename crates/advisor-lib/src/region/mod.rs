//! QoS regions
//!
//! A region groups containers of one QoS level, binds them to NUMA nodes,
//! and owns the provision and headroom policies that size the group. Regions
//! are rebuilt from container state every tick; surviving regions keep their
//! policy state (PID history in particular).

pub mod headroom;
pub mod provision;

use crate::machine::NumaSet;
use crate::metric::MetricsFetcherRef;
use crate::models::{
    ContainerInfo, ControlEssentials, ControlKnob, ControlKnobName, Indicator, QoSLevel,
    RegionType, ResourceEssentials,
};
use anyhow::{bail, Result};
use headroom::{HeadroomInputs, HeadroomPolicy};
use provision::{ProvisionInputs, ProvisionPolicy};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Per-member stats refreshed on every `add_container`
#[derive(Debug, Clone)]
struct RegionContainer {
    pod_uid: String,
    container_name: String,
    cpu_request: f64,
    cpu_limit: f64,
}

pub struct Region {
    name: String,
    region_type: RegionType,
    owner_pool_name: String,
    qos_level: QoSLevel,
    numa_binding: bool,
    binding_numas: NumaSet,
    pods: BTreeMap<String, BTreeSet<String>>,
    members: Vec<RegionContainer>,
    essentials: ResourceEssentials,
    control_essentials: ControlEssentials,
    provision_policy: Box<dyn ProvisionPolicy>,
    headroom_policy: Box<dyn HeadroomPolicy>,
    throttled: bool,
}

impl Region {
    /// Share region. A binding NUMA id makes this a share-NUMA-binding
    /// region with a self-contained budget.
    pub fn share(
        owner_pool_name: &str,
        binding_numa: Option<i32>,
        provision_policy: Box<dyn ProvisionPolicy>,
        headroom_policy: Box<dyn HeadroomPolicy>,
    ) -> Self {
        let (name, numa_binding, binding_numas) = match binding_numa {
            Some(numa) => (
                format!("{}-numa{}", owner_pool_name, numa),
                true,
                NumaSet::from([numa]),
            ),
            None => (owner_pool_name.to_string(), false, NumaSet::new()),
        };
        Self::new(
            name,
            RegionType::Share,
            owner_pool_name,
            QoSLevel::Shared,
            numa_binding,
            binding_numas,
            provision_policy,
            headroom_policy,
        )
    }

    /// One region per (pod, NUMA) for dedicated NUMA-exclusive containers
    pub fn dedicated_numa_exclusive(
        pod_uid: &str,
        numa: i32,
        provision_policy: Box<dyn ProvisionPolicy>,
        headroom_policy: Box<dyn HeadroomPolicy>,
    ) -> Self {
        Self::new(
            format!("dedicated-{}-numa{}", pod_uid, numa),
            RegionType::DedicatedNumaExclusive,
            crate::models::pools::DEDICATED,
            QoSLevel::Dedicated,
            true,
            NumaSet::from([numa]),
            provision_policy,
            headroom_policy,
        )
    }

    /// Isolation region. Named after the origin pool when the pool is
    /// non-exclusive (one shared region), after the pod otherwise.
    pub fn isolation(
        region_name: &str,
        owner_pool_name: &str,
        binding_numa: Option<i32>,
        provision_policy: Box<dyn ProvisionPolicy>,
        headroom_policy: Box<dyn HeadroomPolicy>,
    ) -> Self {
        let (numa_binding, binding_numas) = match binding_numa {
            Some(numa) => (true, NumaSet::from([numa])),
            None => (false, NumaSet::new()),
        };
        Self::new(
            region_name.to_string(),
            RegionType::Isolation,
            owner_pool_name,
            QoSLevel::Shared,
            numa_binding,
            binding_numas,
            provision_policy,
            headroom_policy,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        name: String,
        region_type: RegionType,
        owner_pool_name: &str,
        qos_level: QoSLevel,
        numa_binding: bool,
        binding_numas: NumaSet,
        provision_policy: Box<dyn ProvisionPolicy>,
        headroom_policy: Box<dyn HeadroomPolicy>,
    ) -> Self {
        Self {
            name,
            region_type,
            owner_pool_name: owner_pool_name.to_string(),
            qos_level,
            numa_binding,
            binding_numas,
            pods: BTreeMap::new(),
            members: Vec::new(),
            essentials: ResourceEssentials::default(),
            control_essentials: ControlEssentials::default(),
            provision_policy,
            headroom_policy,
            throttled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    pub fn owner_pool_name(&self) -> &str {
        &self.owner_pool_name
    }

    pub fn is_numa_binding(&self) -> bool {
        self.numa_binding
    }

    pub fn binding_numas(&self) -> &NumaSet {
        &self.binding_numas
    }

    /// Only meaningful for non-binding regions, which collectively span the
    /// NUMAs left over after binding regions claimed theirs
    pub fn set_binding_numas(&mut self, numas: NumaSet) {
        if !self.numa_binding {
            self.binding_numas = numas;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn pods(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.pods
    }

    /// Drop membership before re-assignment; policy state is retained
    pub fn clear(&mut self) {
        self.pods.clear();
        self.members.clear();
    }

    pub fn add_container(&mut self, ci: &ContainerInfo) -> Result<()> {
        if ci.qos_level != self.qos_level {
            bail!(
                "container {}/{} qos {:?} does not match region {} qos {:?}",
                ci.pod_uid,
                ci.container_name,
                ci.qos_level,
                self.name,
                self.qos_level
            );
        }
        if self.region_type == RegionType::DedicatedNumaExclusive
            && !self.pods.is_empty()
            && !self.pods.contains_key(&ci.pod_uid)
        {
            bail!(
                "numa exclusive region {} already serves another pod",
                self.name
            );
        }
        self.pods
            .entry(ci.pod_uid.clone())
            .or_default()
            .insert(ci.container_name.clone());
        self.members.push(RegionContainer {
            pod_uid: ci.pod_uid.clone(),
            container_name: ci.container_name.clone(),
            cpu_request: ci.cpu_request,
            cpu_limit: ci.cpu_limit,
        });
        Ok(())
    }

    pub fn set_essentials(&mut self, essentials: ResourceEssentials) {
        self.essentials = essentials;
    }

    pub fn essentials(&self) -> ResourceEssentials {
        self.essentials
    }

    pub fn set_throttled(&mut self, throttled: bool) {
        self.throttled = throttled;
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn control_essentials(&self) -> &ControlEssentials {
        &self.control_essentials
    }

    /// Sum of member cpu requests
    pub fn pods_cpu_request(&self) -> f64 {
        self.members.iter().map(|m| m.cpu_request).sum()
    }

    /// Sum of member cpu limits; members without a limit fall back to
    /// their request
    pub fn pods_cpu_limit(&self) -> f64 {
        self.members
            .iter()
            .map(|m| if m.cpu_limit > 0.0 { m.cpu_limit } else { m.cpu_request })
            .sum()
    }

    /// Refresh the indicator vector from metrics. The current value of an
    /// indicator is the average across member containers.
    async fn update_control_essentials(
        &mut self,
        metrics: &MetricsFetcherRef,
        targets: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let mut indicators = BTreeMap::new();
        for (indicator, target) in targets {
            let mut sum = 0.0;
            for member in &self.members {
                let data = metrics
                    .get_container_metric(&member.pod_uid, &member.container_name, indicator, None)
                    .await?;
                sum += data.value;
            }
            let current = if self.members.is_empty() {
                0.0
            } else {
                sum / self.members.len() as f64
            };
            indicators.insert(
                indicator.clone(),
                Indicator {
                    current,
                    target: *target,
                },
            );
        }
        self.control_essentials = ControlEssentials { indicators };
        Ok(())
    }

    /// Run one provision policy episode. Isolation regions derive their
    /// knobs directly from member requests and limits.
    pub async fn try_update_provision(&mut self, metrics: &MetricsFetcherRef) {
        if self.region_type == RegionType::Isolation {
            return;
        }

        if self.provision_policy.needs_indicators() {
            let targets = self.provision_policy.indicator_targets();
            if let Err(e) = self.update_control_essentials(metrics, &targets).await {
                debug!(region = %self.name, error = %e, "indicator refresh failed");
                self.provision_policy.mark_failed();
                return;
            }
        }

        let inputs = ProvisionInputs {
            essentials: self.essentials,
            control: &self.control_essentials,
            pods_cpu_request: self.pods_cpu_request(),
        };
        if let Err(e) = self.provision_policy.update(&inputs) {
            debug!(region = %self.name, error = %e, "provision policy update failed");
        }
    }

    /// Current control knob. Isolation regions expose their upper and lower
    /// requirements; other regions proxy to the policy (which refuses to
    /// serve after a failed update).
    pub fn get_provision(&self) -> Result<ControlKnob> {
        if self.region_type == RegionType::Isolation {
            let mut knob = ControlKnob::new();
            knob.insert(
                ControlKnobName::NonReclaimedCpuRequirementUpper,
                self.pods_cpu_limit().ceil().max(1.0),
            );
            knob.insert(
                ControlKnobName::NonReclaimedCpuRequirementLower,
                self.pods_cpu_request().ceil().max(1.0),
            );
            return Ok(knob);
        }
        self.provision_policy.control_knob()
    }

    pub async fn try_update_headroom(&mut self, _metrics: &MetricsFetcherRef) {
        let non_reclaim = self
            .get_provision()
            .ok()
            .and_then(|knob| knob.get(&ControlKnobName::NonReclaimedCpuRequirement).copied())
            .unwrap_or_else(|| self.pods_cpu_request());
        let inputs = HeadroomInputs {
            essentials: self.essentials,
            available: self.essentials.resource_upper_bound,
            non_reclaim_requirement: non_reclaim,
        };
        if let Err(e) = self.headroom_policy.update(&inputs) {
            debug!(region = %self.name, error = %e, "headroom policy update failed");
        }
    }

    pub fn get_headroom(&self) -> Result<f64> {
        self.headroom_policy.headroom()
    }
}
