//! Provision policies
//!
//! A provision policy computes a region's non-reclaimed cpu requirement as a
//! control knob. Only one policy is active per region per tick; a policy
//! whose update failed withholds its knob until the next success.

use crate::models::{
    ControlEssentials, ControlKnob, ControlKnobName, PolicyUpdateStatus, ResourceEssentials,
};
use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Policy selector; the constructor table below is the whole registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionPolicyName {
    None,
    Canonical,
    Rama,
    DynamicQuota,
}

/// Rama (PID) tuning and its indicator targets
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RamaConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub indicators: Vec<IndicatorTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorTarget {
    pub name: String,
    pub target: f64,
}

/// Inputs for one policy episode
pub struct ProvisionInputs<'a> {
    pub essentials: ResourceEssentials,
    pub control: &'a ControlEssentials,
    pub pods_cpu_request: f64,
}

pub trait ProvisionPolicy: Send + Sync {
    fn name(&self) -> ProvisionPolicyName;

    /// Whether the region must refresh indicator metrics before `update`
    fn needs_indicators(&self) -> bool {
        false
    }

    /// Indicator name -> target, for regions that refresh indicators
    fn indicator_targets(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// Force the failed state, e.g. when indicator refresh failed upstream
    fn mark_failed(&mut self);

    fn update(&mut self, inputs: &ProvisionInputs<'_>) -> Result<()>;

    fn control_knob(&self) -> Result<ControlKnob>;
}

/// Constructor table keyed on the policy enum
pub fn new_provision_policy(
    name: ProvisionPolicyName,
    rama: &RamaConfig,
) -> Box<dyn ProvisionPolicy> {
    match name {
        ProvisionPolicyName::None => Box::new(PolicyNone::default()),
        ProvisionPolicyName::Canonical => Box::new(PolicyCanonical::default()),
        ProvisionPolicyName::Rama => Box::new(PolicyRama::new(rama.clone())),
        ProvisionPolicyName::DynamicQuota => Box::new(PolicyDynamicQuota::default()),
    }
}

/// Disables provisioning for a region
#[derive(Default)]
pub struct PolicyNone;

impl ProvisionPolicy for PolicyNone {
    fn name(&self) -> ProvisionPolicyName {
        ProvisionPolicyName::None
    }

    fn mark_failed(&mut self) {}

    fn update(&mut self, _inputs: &ProvisionInputs<'_>) -> Result<()> {
        Ok(())
    }

    fn control_knob(&self) -> Result<ControlKnob> {
        Ok(ControlKnob::new())
    }
}

/// Requirement equals the sum of member requests, clamped to the envelope
#[derive(Default)]
pub struct PolicyCanonical {
    requirement: f64,
    status: Option<PolicyUpdateStatus>,
}

impl ProvisionPolicy for PolicyCanonical {
    fn name(&self) -> ProvisionPolicyName {
        ProvisionPolicyName::Canonical
    }

    fn mark_failed(&mut self) {
        self.status = Some(PolicyUpdateStatus::Failed);
    }

    fn update(&mut self, inputs: &ProvisionInputs<'_>) -> Result<()> {
        let e = inputs.essentials;
        self.requirement = inputs
            .pods_cpu_request
            .clamp(e.resource_lower_bound, e.resource_upper_bound.max(e.resource_lower_bound));
        self.status = Some(PolicyUpdateStatus::Succeeded);
        Ok(())
    }

    fn control_knob(&self) -> Result<ControlKnob> {
        if self.status != Some(PolicyUpdateStatus::Succeeded) {
            bail!("canonical policy has no successful update");
        }
        let mut knob = ControlKnob::new();
        knob.insert(ControlKnobName::NonReclaimedCpuRequirement, self.requirement);
        Ok(knob)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PidState {
    last_error: f64,
    integral: f64,
    initialized: bool,
}

/// PID controller over the region's indicator vector. Each indicator runs an
/// independent controller whose clamped output is its control value; the
/// worst case (largest requirement) wins.
pub struct PolicyRama {
    config: RamaConfig,
    pid_states: BTreeMap<String, PidState>,
    requirement: f64,
    status: Option<PolicyUpdateStatus>,
}

impl PolicyRama {
    pub fn new(config: RamaConfig) -> Self {
        Self {
            config,
            pid_states: BTreeMap::new(),
            requirement: 0.0,
            status: None,
        }
    }
}

impl ProvisionPolicy for PolicyRama {
    fn name(&self) -> ProvisionPolicyName {
        ProvisionPolicyName::Rama
    }

    fn needs_indicators(&self) -> bool {
        true
    }

    fn indicator_targets(&self) -> BTreeMap<String, f64> {
        self.config
            .indicators
            .iter()
            .map(|i| (i.name.clone(), i.target))
            .collect()
    }

    fn mark_failed(&mut self) {
        self.status = Some(PolicyUpdateStatus::Failed);
    }

    fn update(&mut self, inputs: &ProvisionInputs<'_>) -> Result<()> {
        let e = inputs.essentials;
        let lower = e.resource_lower_bound;
        let upper = e.resource_upper_bound.max(lower);

        let mut worst: Option<f64> = None;
        for (name, indicator) in &inputs.control.indicators {
            let state = self.pid_states.entry(name.clone()).or_default();
            let error = indicator.current - indicator.target;
            let derivative = if state.initialized {
                error - state.last_error
            } else {
                0.0
            };

            let next_integral = state.integral + error;
            let u = self.config.kp * error
                + self.config.ki * next_integral
                + self.config.kd * derivative;
            let control = u.clamp(lower, upper);

            // anti-windup: freeze the integral while the output saturates
            if (u - control).abs() < f64::EPSILON {
                state.integral = next_integral;
            }
            state.last_error = error;
            state.initialized = true;

            worst = Some(worst.map_or(control, |w: f64| w.max(control)));
        }

        // without indicators the canonical request sum is in charge
        self.requirement =
            worst.unwrap_or_else(|| inputs.pods_cpu_request.clamp(lower, upper));
        self.status = Some(PolicyUpdateStatus::Succeeded);
        Ok(())
    }

    fn control_knob(&self) -> Result<ControlKnob> {
        if self.status != Some(PolicyUpdateStatus::Succeeded) {
            bail!("rama policy has no successful update");
        }
        let mut knob = ControlKnob::new();
        knob.insert(ControlKnobName::NonReclaimedCpuRequirement, self.requirement);
        Ok(knob)
    }
}

/// Canonical requirement plus a reclaimed quota derived from the envelope
/// slack; used on cgroup v2 unified nodes where the reclaim pool is quota
/// throttled instead of shrunk.
#[derive(Default)]
pub struct PolicyDynamicQuota {
    requirement: f64,
    reclaimed_quota: f64,
    status: Option<PolicyUpdateStatus>,
}

impl ProvisionPolicy for PolicyDynamicQuota {
    fn name(&self) -> ProvisionPolicyName {
        ProvisionPolicyName::DynamicQuota
    }

    fn mark_failed(&mut self) {
        self.status = Some(PolicyUpdateStatus::Failed);
    }

    fn update(&mut self, inputs: &ProvisionInputs<'_>) -> Result<()> {
        let e = inputs.essentials;
        self.requirement = inputs
            .pods_cpu_request
            .clamp(e.resource_lower_bound, e.resource_upper_bound.max(e.resource_lower_bound));
        self.reclaimed_quota = e
            .reserved_for_reclaim
            .max(e.resource_upper_bound - self.requirement);
        self.status = Some(PolicyUpdateStatus::Succeeded);
        Ok(())
    }

    fn control_knob(&self) -> Result<ControlKnob> {
        if self.status != Some(PolicyUpdateStatus::Succeeded) {
            bail!("dynamic quota policy has no successful update");
        }
        let mut knob = ControlKnob::new();
        knob.insert(ControlKnobName::NonReclaimedCpuRequirement, self.requirement);
        knob.insert(ControlKnobName::ReclaimedCpuQuota, self.reclaimed_quota);
        Ok(knob)
    }
}
