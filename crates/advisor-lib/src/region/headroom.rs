//! CPU headroom policies
//!
//! Headroom is the cpu a region can lend to reclaimed workloads: whatever
//! availability is left after non-reclaim provisioning, never below the
//! reserved reclaim floor.

use crate::models::{PolicyUpdateStatus, ResourceEssentials};
use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadroomPolicyName {
    None,
    Canonical,
    NumaExclusive,
}

pub struct HeadroomInputs {
    pub essentials: ResourceEssentials,
    /// Availability of the region's binding NUMAs
    pub available: f64,
    pub non_reclaim_requirement: f64,
}

pub trait HeadroomPolicy: Send + Sync {
    fn name(&self) -> HeadroomPolicyName;

    fn update(&mut self, inputs: &HeadroomInputs) -> Result<()>;

    fn headroom(&self) -> Result<f64>;
}

/// Constructor table keyed on the policy enum
pub fn new_headroom_policy(name: HeadroomPolicyName) -> Box<dyn HeadroomPolicy> {
    match name {
        HeadroomPolicyName::None => Box::new(PolicyNone::default()),
        HeadroomPolicyName::Canonical => Box::new(PolicyCanonical::new(HeadroomPolicyName::Canonical)),
        HeadroomPolicyName::NumaExclusive => {
            Box::new(PolicyCanonical::new(HeadroomPolicyName::NumaExclusive))
        }
    }
}

/// Region lends nothing
#[derive(Default)]
pub struct PolicyNone;

impl HeadroomPolicy for PolicyNone {
    fn name(&self) -> HeadroomPolicyName {
        HeadroomPolicyName::None
    }

    fn update(&mut self, _inputs: &HeadroomInputs) -> Result<()> {
        Ok(())
    }

    fn headroom(&self) -> Result<f64> {
        Ok(0.0)
    }
}

/// Availability minus non-reclaim provisioning, floored at the reclaim
/// reserve. The NUMA-exclusive variant runs the same computation against the
/// binding NUMA's availability (which is what `available` carries for a
/// NUMA-binding region).
pub struct PolicyCanonical {
    name: HeadroomPolicyName,
    headroom: f64,
    status: Option<PolicyUpdateStatus>,
}

impl PolicyCanonical {
    fn new(name: HeadroomPolicyName) -> Self {
        Self {
            name,
            headroom: 0.0,
            status: None,
        }
    }
}

impl HeadroomPolicy for PolicyCanonical {
    fn name(&self) -> HeadroomPolicyName {
        self.name
    }

    fn update(&mut self, inputs: &HeadroomInputs) -> Result<()> {
        let e = inputs.essentials;
        self.headroom = if e.enable_reclaim {
            (inputs.available - inputs.non_reclaim_requirement).max(e.reserved_for_reclaim)
        } else {
            e.reserved_for_reclaim
        };
        self.status = Some(PolicyUpdateStatus::Succeeded);
        Ok(())
    }

    fn headroom(&self) -> Result<f64> {
        if self.status != Some(PolicyUpdateStatus::Succeeded) {
            bail!("headroom policy has no successful update");
        }
        Ok(self.headroom)
    }
}
