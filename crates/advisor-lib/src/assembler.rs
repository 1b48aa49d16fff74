//! Provision assembler
//!
//! Merges per-region provision outputs into a globally consistent allocation
//! of named cpu pools across NUMA nodes. The assembler works on a value
//! snapshot taken at the start of the tick and returns both the calculation
//! result and the throttle verdict per region.

use crate::machine::NumaSet;
use crate::models::{
    pools, ControlKnob, ControlKnobName, CpuCalculationResult, CpuResource, RegionType,
    FAKED_NUMA_ID,
};
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::debug;

/// Immutable view of one region, captured after policy updates
#[derive(Debug, Clone)]
pub struct RegionSnapshot {
    pub name: String,
    pub region_type: RegionType,
    pub numa_binding: bool,
    pub binding_numas: NumaSet,
    pub owner_pool_name: String,
    pub control_knob: ControlKnob,
    pub pods_cpu_request: f64,
}

impl RegionSnapshot {
    fn knob(&self, name: ControlKnobName) -> Option<f64> {
        self.control_knob.get(&name).copied()
    }

    /// Non-reclaim requirement; canonical fallback is the request sum
    fn non_reclaim_requirement(&self) -> f64 {
        self.knob(ControlKnobName::NonReclaimedCpuRequirement)
            .unwrap_or(self.pods_cpu_request)
    }

    fn binding_numa(&self) -> Option<i32> {
        self.binding_numas.iter().next().copied()
    }
}

/// Value snapshot handed to the assembler each tick
#[derive(Debug, Clone)]
pub struct AssemblerInputs {
    pub regions: Vec<RegionSnapshot>,
    /// numa id -> capacity minus the reserve share
    pub numa_available: BTreeMap<i32, u32>,
    /// numa id -> reclaim floor
    pub reserved_for_reclaim: BTreeMap<i32, u32>,
    pub non_binding_numas: NumaSet,
    pub reserve_pool_size: u32,
    pub enable_reclaim: bool,
    pub allow_shared_cores_overlap_reclaimed_cores: bool,
    pub cgroup_v2_unified: bool,
}

impl AssemblerInputs {
    fn available_in(&self, numas: &NumaSet) -> u32 {
        numas
            .iter()
            .map(|id| self.numa_available.get(id).copied().unwrap_or(0))
            .sum()
    }

    fn reserved_for_reclaim_in(&self, numas: &NumaSet) -> u32 {
        numas
            .iter()
            .map(|id| self.reserved_for_reclaim.get(id).copied().unwrap_or(0))
            .sum()
    }

    /// Pools expand to fill the budget when reclaim is off or the reclaim
    /// pool overlaps the share pools anyway
    fn allow_expand(&self) -> bool {
        !self.enable_reclaim || self.allow_shared_cores_overlap_reclaimed_cores
    }
}

#[derive(Debug, Default)]
pub struct AssemblerOutput {
    pub result: CpuCalculationResult,
    /// region name -> whether the regulator shrank it below its requirement
    pub throttled: BTreeMap<String, bool>,
}

/// Scale pool requirements into a budget.
///
/// Isolation pools enter with fixed sizes; share requirements are scaled
/// proportionally into what remains. When the requirements overshoot, they
/// are shrunk proportionally and the result is flagged throttled. When they
/// undershoot and `allow_expand` holds, they grow to consume the budget.
/// Every pool receives at least one cpu.
pub fn regulate_pool_sizes(
    requirements: &BTreeMap<String, u32>,
    isolation: &BTreeMap<String, u32>,
    budget: u32,
    allow_expand: bool,
) -> (BTreeMap<String, u32>, bool) {
    let isolation_sum: u32 = isolation.values().sum();
    let requirement_sum: u32 = requirements.values().sum();
    let share_budget = budget.saturating_sub(isolation_sum);

    let throttled = requirement_sum + isolation_sum > budget;
    let target = if throttled || allow_expand {
        share_budget
    } else {
        requirement_sum
    };

    let mut sizes = normalize_pool_sizes(requirements, target);
    for (pool, size) in isolation {
        sizes.insert(pool.clone(), (*size).max(1));
    }
    (sizes, throttled)
}

/// Proportional integer split of `target` across the requirement weights,
/// residual carried onto the largest pool, floor of one per pool
fn normalize_pool_sizes(requirements: &BTreeMap<String, u32>, target: u32) -> BTreeMap<String, u32> {
    if requirements.is_empty() {
        return BTreeMap::new();
    }

    let weight_sum: u64 = requirements.values().map(|r| (*r).max(1) as u64).sum();
    let mut sizes: BTreeMap<String, u32> = requirements
        .iter()
        .map(|(pool, requirement)| {
            let weight = (*requirement).max(1) as f64;
            let share = (target as f64 * weight / weight_sum as f64).round() as u32;
            (pool.clone(), share.max(1))
        })
        .collect();

    let mut diff = target as i64 - sizes.values().map(|s| *s as i64).sum::<i64>();
    while diff != 0 {
        // deterministic carry: largest pool first, name as tie break
        let candidate = sizes
            .iter()
            .filter(|(_, size)| diff > 0 || **size > 1)
            .max_by_key(|(name, size)| (**size, std::cmp::Reverse(name.clone())))
            .map(|(name, _)| name.clone());
        let Some(pool) = candidate else {
            break;
        };
        let entry = sizes.get_mut(&pool).unwrap();
        if diff > 0 {
            *entry += 1;
            diff -= 1;
        } else {
            *entry -= 1;
            diff += 1;
        }
    }
    sizes
}

/// Split a reclaim overlap target across share pools in proportion to their
/// sizes, preserving the exact sum; every non-empty pool gets at least one.
pub fn regulate_overlap_reclaim_pool_size(
    share_sizes: &BTreeMap<String, u32>,
    target: u32,
) -> BTreeMap<String, u32> {
    let size_sum: u64 = share_sizes.values().map(|s| *s as u64).sum();
    if size_sum == 0 || target == 0 {
        return BTreeMap::new();
    }

    let mut overlaps: BTreeMap<String, u32> = share_sizes
        .iter()
        .filter(|(_, size)| **size > 0)
        .map(|(pool, size)| {
            let share = (target as f64 * *size as f64 / size_sum as f64).round() as u32;
            (pool.clone(), share.max(1))
        })
        .collect();

    let mut diff = target as i64 - overlaps.values().map(|s| *s as i64).sum::<i64>();
    while diff != 0 {
        let candidate = if diff > 0 {
            // hand the residual to the smallest pool
            overlaps
                .iter()
                .min_by_key(|(name, size)| (**size, name.clone()))
                .map(|(name, _)| name.clone())
        } else {
            overlaps
                .iter()
                .filter(|(_, size)| **size > 1)
                .max_by_key(|(name, size)| (**size, std::cmp::Reverse(name.clone())))
                .map(|(name, _)| name.clone())
        };
        let Some(pool) = candidate else {
            break;
        };
        let entry = overlaps.get_mut(&pool).unwrap();
        if diff > 0 {
            *entry += 1;
            diff -= 1;
        } else {
            *entry -= 1;
            diff += 1;
        }
    }
    overlaps
}

/// Group regions by binding NUMA and type for the per-NUMA walks
struct RegionMapHelper<'a> {
    by_numa: BTreeMap<i32, BTreeMap<RegionType, Vec<&'a RegionSnapshot>>>,
}

impl<'a> RegionMapHelper<'a> {
    fn new(regions: &'a [RegionSnapshot]) -> Self {
        let mut by_numa: BTreeMap<i32, BTreeMap<RegionType, Vec<&'a RegionSnapshot>>> =
            BTreeMap::new();
        for region in regions {
            if !region.numa_binding {
                continue;
            }
            for numa in region.binding_numas.iter() {
                by_numa
                    .entry(*numa)
                    .or_default()
                    .entry(region.region_type)
                    .or_default()
                    .push(region);
            }
        }
        Self { by_numa }
    }

    fn regions(&self, numa: i32, region_type: RegionType) -> &[&'a RegionSnapshot] {
        self.by_numa
            .get(&numa)
            .and_then(|types| types.get(&region_type))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn numas_with(&self, region_type: RegionType) -> Vec<i32> {
        self.by_numa
            .iter()
            .filter(|(_, types)| types.contains_key(&region_type))
            .map(|(numa, _)| *numa)
            .collect()
    }
}

pub fn assemble_provision(inputs: &AssemblerInputs) -> Result<AssemblerOutput> {
    let mut output = AssemblerOutput {
        result: CpuCalculationResult::new(inputs.allow_shared_cores_overlap_reclaimed_cores),
        throttled: BTreeMap::new(),
    };

    output.result.set_pool_entry(
        pools::RESERVE,
        FAKED_NUMA_ID,
        CpuResource::sized(inputs.reserve_pool_size),
    );

    let helper = RegionMapHelper::new(&inputs.regions);

    // share-NUMA-binding budgets, one per NUMA
    for numa in helper.numas_with(RegionType::Share) {
        assemble_share_numa_binding(inputs, &helper, numa, &mut output);
    }

    // isolation-only NUMAs: share-binding processing above already covered
    // NUMAs hosting both
    for numa in helper.numas_with(RegionType::Isolation) {
        if !helper.regions(numa, RegionType::Share).is_empty() {
            continue;
        }
        assemble_isolation_numa_binding(inputs, &helper, numa, &mut output);
    }

    for region in &inputs.regions {
        if region.region_type == RegionType::DedicatedNumaExclusive {
            assemble_dedicated(inputs, region, &mut output);
        }
    }

    assemble_non_binding(inputs, &mut output);

    Ok(output)
}

/// A NUMA that hosts share-NUMA-binding regions is a self-contained budget:
/// its share pools, its isolation pools, and its reclaim slice all come out
/// of the NUMA's own availability.
fn assemble_share_numa_binding(
    inputs: &AssemblerInputs,
    helper: &RegionMapHelper<'_>,
    numa: i32,
    output: &mut AssemblerOutput,
) {
    let share_regions = helper.regions(numa, RegionType::Share);
    let isolation_regions = helper.regions(numa, RegionType::Isolation);
    let numas = NumaSet::from([numa]);
    let available = inputs.available_in(&numas);
    let reserved_for_reclaim = inputs.reserved_for_reclaim_in(&numas);

    let mut requirements: BTreeMap<String, u32> = BTreeMap::new();
    let mut non_reclaim_sum = 0u32;
    let mut pods_request_sum = 0u32;
    for region in share_regions {
        let pods_request = (region.pods_cpu_request.ceil() as u32).max(1);
        *requirements.entry(region.owner_pool_name.clone()).or_default() += pods_request;
        pods_request_sum += pods_request;
        non_reclaim_sum += region.non_reclaim_requirement().ceil().max(0.0) as u32;
    }

    // isolation regions run at their upper bound unless the NUMA cannot fit
    let isolation_upper_sum: u32 = isolation_regions
        .iter()
        .map(|r| {
            r.knob(ControlKnobName::NonReclaimedCpuRequirementUpper)
                .unwrap_or(0.0)
                .ceil() as u32
        })
        .sum();
    let isolation_knob = if pods_request_sum + isolation_upper_sum > available {
        ControlKnobName::NonReclaimedCpuRequirementLower
    } else {
        ControlKnobName::NonReclaimedCpuRequirementUpper
    };
    let isolation_req: BTreeMap<String, u32> = isolation_regions
        .iter()
        .map(|r| {
            (
                r.name.clone(),
                r.knob(isolation_knob).unwrap_or(0.0).ceil().max(1.0) as u32,
            )
        })
        .collect();

    let (sizes, throttled) =
        regulate_pool_sizes(&requirements, &isolation_req, available, inputs.allow_expand());
    for region in share_regions {
        output.throttled.insert(region.name.clone(), throttled);
    }

    for (pool, size) in &sizes {
        output.result.set_pool_entry(pool, numa, CpuResource::sized(*size));
    }

    // derive the reclaim slice for this NUMA
    let share_sizes: BTreeMap<String, u32> = requirements
        .keys()
        .map(|pool| (pool.clone(), sizes.get(pool).copied().unwrap_or(0)))
        .collect();
    let owner_size_sum: u32 = share_sizes.values().sum();
    let slack = if inputs.enable_reclaim {
        owner_size_sum.saturating_sub(non_reclaim_sum)
    } else {
        0
    };

    if inputs.allow_shared_cores_overlap_reclaimed_cores {
        if inputs.cgroup_v2_unified {
            // reclaimed cores run across the whole share pool, throttled by quota
            let knob_quota = share_regions
                .iter()
                .filter_map(|r| r.knob(ControlKnobName::ReclaimedCpuQuota))
                .sum::<f64>();
            let quota = if knob_quota > 0.0 {
                knob_quota
            } else {
                (reserved_for_reclaim.max(slack)) as f64
            };
            output.result.set_pool_entry(
                pools::RECLAIM,
                numa,
                CpuResource::with_quota(owner_size_sum, quota),
            );
        } else {
            let reclaim_size = reserved_for_reclaim.max(slack).min(owner_size_sum);
            for (pool, overlap) in regulate_overlap_reclaim_pool_size(&share_sizes, reclaim_size) {
                output
                    .result
                    .set_pool_overlap_info(pools::RECLAIM, numa, &pool, overlap);
            }
            output
                .result
                .set_pool_entry(pools::RECLAIM, numa, CpuResource::sized(reclaim_size));
        }
    } else {
        let pool_size_sum: u32 = sizes.values().sum();
        let reclaim_size = if inputs.enable_reclaim {
            available.saturating_sub(pool_size_sum) + reserved_for_reclaim
        } else {
            reserved_for_reclaim
        };
        output
            .result
            .set_pool_entry(pools::RECLAIM, numa, CpuResource::sized(reclaim_size));
    }
}

/// Isolation regions alone on a NUMA: emit them at their upper bound and
/// leave the rest to reclaim
fn assemble_isolation_numa_binding(
    inputs: &AssemblerInputs,
    helper: &RegionMapHelper<'_>,
    numa: i32,
    output: &mut AssemblerOutput,
) {
    let numas = NumaSet::from([numa]);
    let available = inputs.available_in(&numas);
    let reserved_for_reclaim = inputs.reserved_for_reclaim_in(&numas);

    let mut isolation_sum = 0u32;
    for region in helper.regions(numa, RegionType::Isolation) {
        let size = region
            .knob(ControlKnobName::NonReclaimedCpuRequirementUpper)
            .unwrap_or(0.0)
            .ceil()
            .max(1.0) as u32;
        isolation_sum += size;
        output
            .result
            .set_pool_entry(&region.name, numa, CpuResource::sized(size));
    }

    let reclaim_size = available.saturating_sub(isolation_sum).max(reserved_for_reclaim);
    output
        .result
        .set_pool_entry(pools::RECLAIM, numa, CpuResource::sized(reclaim_size));
}

/// Dedicated NUMA-exclusive regions only contribute a reclaim slice; their
/// own cpuset is owned by the enforcement layer.
fn assemble_dedicated(
    inputs: &AssemblerInputs,
    region: &RegionSnapshot,
    output: &mut AssemblerOutput,
) {
    let Some(numa) = region.binding_numa() else {
        return;
    };
    let numas = NumaSet::from([numa]);
    let available = inputs.available_in(&numas);
    let reserved_for_reclaim = inputs.reserved_for_reclaim_in(&numas);

    let non_reclaim = if inputs.enable_reclaim {
        region.non_reclaim_requirement().ceil() as u32
    } else {
        available
    };

    if inputs.cgroup_v2_unified {
        let mut quota = reserved_for_reclaim.max(available.saturating_sub(non_reclaim)) as f64;
        if let Some(knob) = region.knob(ControlKnobName::ReclaimedCpuQuota) {
            quota = quota.min(knob);
        }
        output
            .result
            .set_pool_entry(pools::RECLAIM, numa, CpuResource::with_quota(available, quota));
    } else {
        let size = reserved_for_reclaim.max(available.saturating_sub(non_reclaim));
        output
            .result
            .set_pool_entry(pools::RECLAIM, numa, CpuResource::sized(size));
    }

    debug!(
        region = %region.name,
        numa,
        available,
        non_reclaim,
        reserved_for_reclaim,
        "dedicated numa exclusive assembled"
    );
}

/// The non-binding collective: every share and isolation region without a
/// NUMA binding shares the budget of the non-binding NUMAs.
fn assemble_non_binding(inputs: &AssemblerInputs, output: &mut AssemblerOutput) {
    let mut share_requirements: BTreeMap<String, u32> = BTreeMap::new();
    let mut share_requests: BTreeMap<String, u32> = BTreeMap::new();
    let mut isolation_uppers: BTreeMap<String, u32> = BTreeMap::new();
    let mut isolation_lowers: BTreeMap<String, u32> = BTreeMap::new();
    let mut share_region_names: Vec<&str> = Vec::new();

    for region in &inputs.regions {
        if region.numa_binding {
            continue;
        }
        match region.region_type {
            RegionType::Share => {
                let requirement =
                    (region.non_reclaim_requirement().ceil() as u32).max(1);
                let request = (region.pods_cpu_request.ceil() as u32).max(1);
                *share_requirements.entry(region.owner_pool_name.clone()).or_default() +=
                    requirement;
                *share_requests.entry(region.owner_pool_name.clone()).or_default() += request;
                share_region_names.push(&region.name);
            }
            RegionType::Isolation => {
                let upper = region
                    .knob(ControlKnobName::NonReclaimedCpuRequirementUpper)
                    .unwrap_or(0.0)
                    .ceil()
                    .max(1.0) as u32;
                let lower = region
                    .knob(ControlKnobName::NonReclaimedCpuRequirementLower)
                    .unwrap_or(0.0)
                    .ceil()
                    .max(1.0) as u32;
                isolation_uppers.insert(region.name.clone(), upper);
                isolation_lowers.insert(region.name.clone(), lower);
            }
            RegionType::DedicatedNumaExclusive => {}
        }
    }

    let available = inputs.available_in(&inputs.non_binding_numas);
    let reserved_for_reclaim = inputs.reserved_for_reclaim_in(&inputs.non_binding_numas);

    let requirement_sum: u32 = share_requirements.values().sum();
    let upper_sum: u32 = isolation_uppers.values().sum();
    let isolation_req = if requirement_sum + upper_sum > available {
        &isolation_lowers
    } else {
        &isolation_uppers
    };

    // under expansion the request sums drive the split; otherwise the knobs do
    let requirements = if inputs.allow_expand() {
        &share_requests
    } else {
        &share_requirements
    };

    let (sizes, throttled) =
        regulate_pool_sizes(requirements, isolation_req, available, inputs.allow_expand());
    for name in share_region_names {
        output.throttled.insert(name.to_string(), throttled);
    }

    for (pool, size) in &sizes {
        output
            .result
            .set_pool_entry(pool, FAKED_NUMA_ID, CpuResource::sized(*size));
    }

    // the non-binding reclaim pool
    let share_sizes: BTreeMap<String, u32> = share_requirements
        .keys()
        .map(|pool| (pool.clone(), sizes.get(pool).copied().unwrap_or(0)))
        .collect();
    let share_size_sum: u32 = share_sizes.values().sum();
    let pool_size_sum: u32 = sizes.values().sum();

    let reclaim_size = if inputs.allow_shared_cores_overlap_reclaimed_cores {
        let slack = if inputs.enable_reclaim {
            share_size_sum.saturating_sub(requirement_sum)
        } else {
            0
        };
        let mut reclaim = reserved_for_reclaim.max(slack);
        if !share_sizes.is_empty() {
            reclaim = reclaim.min(share_size_sum);
            for (pool, overlap) in regulate_overlap_reclaim_pool_size(&share_sizes, reclaim) {
                output
                    .result
                    .set_pool_overlap_info(pools::RECLAIM, FAKED_NUMA_ID, &pool, overlap);
            }
        }
        reclaim
    } else if inputs.enable_reclaim {
        available.saturating_sub(pool_size_sum) + reserved_for_reclaim
    } else {
        reserved_for_reclaim
    };

    output
        .result
        .set_pool_entry(pools::RECLAIM, FAKED_NUMA_ID, CpuResource::sized(reclaim_size));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knob(entries: &[(ControlKnobName, f64)]) -> ControlKnob {
        entries.iter().copied().collect()
    }

    fn share_snapshot(
        name: &str,
        pool: &str,
        numa: Option<i32>,
        requirement: f64,
        request: f64,
    ) -> RegionSnapshot {
        RegionSnapshot {
            name: name.to_string(),
            region_type: RegionType::Share,
            numa_binding: numa.is_some(),
            binding_numas: numa.map(|n| NumaSet::from([n])).unwrap_or_default(),
            owner_pool_name: pool.to_string(),
            control_knob: knob(&[(ControlKnobName::NonReclaimedCpuRequirement, requirement)]),
            pods_cpu_request: request,
        }
    }

    fn isolation_snapshot(
        name: &str,
        numa: Option<i32>,
        upper: f64,
        lower: f64,
    ) -> RegionSnapshot {
        RegionSnapshot {
            name: name.to_string(),
            region_type: RegionType::Isolation,
            numa_binding: numa.is_some(),
            binding_numas: numa.map(|n| NumaSet::from([n])).unwrap_or_default(),
            owner_pool_name: name.to_string(),
            control_knob: knob(&[
                (ControlKnobName::NonReclaimedCpuRequirementUpper, upper),
                (ControlKnobName::NonReclaimedCpuRequirementLower, lower),
            ]),
            pods_cpu_request: lower,
        }
    }

    fn inputs_on_one_numa(
        regions: Vec<RegionSnapshot>,
        available: u32,
        reserved_for_reclaim: u32,
    ) -> AssemblerInputs {
        AssemblerInputs {
            regions,
            numa_available: BTreeMap::from([(0, available)]),
            reserved_for_reclaim: BTreeMap::from([(0, reserved_for_reclaim)]),
            non_binding_numas: NumaSet::new(),
            reserve_pool_size: 2,
            enable_reclaim: true,
            allow_shared_cores_overlap_reclaimed_cores: false,
            cgroup_v2_unified: false,
        }
    }

    #[test]
    fn test_regulate_keeps_fitting_requirements() {
        let requirements = BTreeMap::from([("a".to_string(), 10), ("b".to_string(), 8)]);
        let (sizes, throttled) =
            regulate_pool_sizes(&requirements, &BTreeMap::new(), 22, false);
        assert_eq!(sizes["a"], 10);
        assert_eq!(sizes["b"], 8);
        assert!(!throttled);
    }

    #[test]
    fn test_regulate_shrinks_proportionally() {
        let requirements = BTreeMap::from([("a".to_string(), 14), ("b".to_string(), 12)]);
        let (sizes, throttled) =
            regulate_pool_sizes(&requirements, &BTreeMap::new(), 22, false);
        assert_eq!(sizes["a"], 12);
        assert_eq!(sizes["b"], 10);
        assert!(throttled);
    }

    #[test]
    fn test_regulate_expands_to_fill_budget() {
        let requirements = BTreeMap::from([("a".to_string(), 6), ("b".to_string(), 3)]);
        let (sizes, throttled) = regulate_pool_sizes(&requirements, &BTreeMap::new(), 18, true);
        assert_eq!(sizes.values().sum::<u32>(), 18);
        assert_eq!(sizes["a"], 12);
        assert_eq!(sizes["b"], 6);
        assert!(!throttled);
    }

    #[test]
    fn test_regulate_reserves_isolation_first() {
        let requirements = BTreeMap::from([("a".to_string(), 16)]);
        let isolation = BTreeMap::from([("iso".to_string(), 4)]);
        let (sizes, throttled) = regulate_pool_sizes(&requirements, &isolation, 20, false);
        assert_eq!(sizes["a"], 16);
        assert_eq!(sizes["iso"], 4);
        assert!(!throttled);
    }

    #[test]
    fn test_regulate_every_pool_gets_at_least_one() {
        let requirements =
            BTreeMap::from([("a".to_string(), 100), ("b".to_string(), 0), ("c".to_string(), 0)]);
        let (sizes, throttled) = regulate_pool_sizes(&requirements, &BTreeMap::new(), 8, false);
        assert!(sizes.values().all(|s| *s >= 1));
        assert_eq!(sizes.values().sum::<u32>(), 8);
        assert!(throttled);
    }

    #[test]
    fn test_overlap_regulator_preserves_sum() {
        let share_sizes = BTreeMap::from([
            ("a".to_string(), 12),
            ("b".to_string(), 7),
            ("c".to_string(), 3),
        ]);
        let overlaps = regulate_overlap_reclaim_pool_size(&share_sizes, 10);
        assert_eq!(overlaps.values().sum::<u32>(), 10);
        assert!(overlaps.values().all(|o| *o >= 1));
        assert!(overlaps["a"] >= overlaps["b"]);
        assert!(overlaps["b"] >= overlaps["c"]);
    }

    #[test]
    fn test_overlap_regulator_small_target() {
        let share_sizes = BTreeMap::from([("a".to_string(), 20), ("b".to_string(), 1)]);
        let overlaps = regulate_overlap_reclaim_pool_size(&share_sizes, 2);
        assert_eq!(overlaps.values().sum::<u32>(), 2);
        assert!(overlaps.values().all(|o| *o >= 1));
    }

    // two NUMA-binding share pools, reclaim on, overlap off
    #[test]
    fn test_two_snb_pools_reclaim_enabled_no_overlap() {
        let regions = vec![
            share_snapshot("share-a-numa0", "share-a", Some(0), 10.0, 10.0),
            share_snapshot("share-b-numa0", "share-b", Some(0), 8.0, 8.0),
        ];
        let inputs = inputs_on_one_numa(regions, 22, 4);

        let output = assemble_provision(&inputs).unwrap();
        assert_eq!(output.result.pool_entry("share-a", 0).unwrap().size, 10);
        assert_eq!(output.result.pool_entry("share-b", 0).unwrap().size, 8);
        assert_eq!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size, 8);
        assert_eq!(output.throttled["share-a-numa0"], false);
        assert_eq!(output.throttled["share-b-numa0"], false);
    }

    // overcommit forces a proportional shrink
    #[test]
    fn test_overcommit_throttles_snb_pools() {
        let regions = vec![
            share_snapshot("share-a-numa0", "share-a", Some(0), 14.0, 14.0),
            share_snapshot("share-b-numa0", "share-b", Some(0), 12.0, 12.0),
        ];
        let inputs = inputs_on_one_numa(regions, 22, 4);

        let output = assemble_provision(&inputs).unwrap();
        assert_eq!(output.result.pool_entry("share-a", 0).unwrap().size, 12);
        assert_eq!(output.result.pool_entry("share-b", 0).unwrap().size, 10);
        assert_eq!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size, 4);
        assert_eq!(output.throttled["share-a-numa0"], true);
        assert_eq!(output.throttled["share-b-numa0"], true);
    }

    // dedicated NUMA-exclusive on cgroup v2
    #[test]
    fn test_dedicated_numa_exclusive_v2_quota() {
        let region = RegionSnapshot {
            name: "dedicated-pod-numa0".to_string(),
            region_type: RegionType::DedicatedNumaExclusive,
            numa_binding: true,
            binding_numas: NumaSet::from([0]),
            owner_pool_name: pools::DEDICATED.to_string(),
            control_knob: knob(&[(ControlKnobName::NonReclaimedCpuRequirement, 20.0)]),
            pods_cpu_request: 20.0,
        };
        let mut inputs = inputs_on_one_numa(vec![region], 32, 6);
        inputs.reserve_pool_size = 0;
        inputs.cgroup_v2_unified = true;

        let output = assemble_provision(&inputs).unwrap();
        let reclaim = output.result.pool_entry(pools::RECLAIM, 0).unwrap();
        assert_eq!(reclaim.size, 32);
        assert_eq!(reclaim.quota, 12.0);
    }

    // isolation downgrades to lower bounds when uppers
    // overshoot the non-binding budget
    #[test]
    fn test_isolation_downgrade_to_lower_bounds() {
        let regions = vec![
            share_snapshot("share", "share", None, 16.0, 16.0),
            isolation_snapshot("isolation-pod", None, 10.0, 4.0),
        ];
        let inputs = AssemblerInputs {
            regions,
            numa_available: BTreeMap::from([(0, 20)]),
            reserved_for_reclaim: BTreeMap::from([(0, 2)]),
            non_binding_numas: NumaSet::from([0]),
            reserve_pool_size: 2,
            enable_reclaim: true,
            allow_shared_cores_overlap_reclaimed_cores: false,
            cgroup_v2_unified: false,
        };

        let output = assemble_provision(&inputs).unwrap();
        assert_eq!(
            output.result.pool_entry("share", FAKED_NUMA_ID).unwrap().size,
            16
        );
        assert_eq!(
            output
                .result
                .pool_entry("isolation-pod", FAKED_NUMA_ID)
                .unwrap()
                .size,
            4
        );
        assert_eq!(output.throttled["share"], false);
    }

    #[test]
    fn test_snb_overlap_enabled_records_overlap() {
        let regions = vec![share_snapshot("share-numa0", "share", Some(0), 14.0, 14.0)];
        let mut inputs = inputs_on_one_numa(regions, 22, 4);
        inputs.allow_shared_cores_overlap_reclaimed_cores = true;

        let output = assemble_provision(&inputs).unwrap();
        // expansion fills the NUMA: share grows to 22
        assert_eq!(output.result.pool_entry("share", 0).unwrap().size, 22);
        // reclaim overlaps the share pool with the expansion slack
        let reclaim = output.result.pool_entry(pools::RECLAIM, 0).unwrap();
        assert_eq!(reclaim.size, 8);
        assert_eq!(
            output.result.pool_overlap_info["reclaim"][&0]["share"],
            8
        );
    }

    #[test]
    fn test_snb_overlap_disabled_reclaim_collapses_without_reclaim() {
        let regions = vec![share_snapshot("share-numa0", "share", Some(0), 10.0, 10.0)];
        let mut inputs = inputs_on_one_numa(regions, 22, 4);
        inputs.enable_reclaim = false;

        let output = assemble_provision(&inputs).unwrap();
        // reclaim disabled expands the share pool over the whole budget
        assert_eq!(output.result.pool_entry("share", 0).unwrap().size, 22);
        assert_eq!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size, 4);
    }

    #[test]
    fn test_isolation_alone_on_numa() {
        let regions = vec![isolation_snapshot("isolation-pod", Some(0), 6.0, 3.0)];
        let inputs = inputs_on_one_numa(regions, 22, 4);

        let output = assemble_provision(&inputs).unwrap();
        assert_eq!(output.result.pool_entry("isolation-pod", 0).unwrap().size, 6);
        assert_eq!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size, 16);
    }

    #[test]
    fn test_dedicated_reclaim_disabled_leaves_only_the_floor() {
        let region = RegionSnapshot {
            name: "dedicated-pod-numa0".to_string(),
            region_type: RegionType::DedicatedNumaExclusive,
            numa_binding: true,
            binding_numas: NumaSet::from([0]),
            owner_pool_name: pools::DEDICATED.to_string(),
            control_knob: knob(&[(ControlKnobName::NonReclaimedCpuRequirement, 20.0)]),
            pods_cpu_request: 20.0,
        };
        let mut inputs = inputs_on_one_numa(vec![region], 32, 6);
        inputs.enable_reclaim = false;

        let output = assemble_provision(&inputs).unwrap();
        assert_eq!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size, 6);
    }

    #[test]
    fn test_non_binding_overlap_distributes_reclaim() {
        let regions = vec![
            share_snapshot("share-a", "share-a", None, 10.0, 10.0),
            share_snapshot("share-b", "share-b", None, 6.0, 6.0),
        ];
        let inputs = AssemblerInputs {
            regions,
            numa_available: BTreeMap::from([(0, 22)]),
            reserved_for_reclaim: BTreeMap::from([(0, 4)]),
            non_binding_numas: NumaSet::from([0]),
            reserve_pool_size: 2,
            enable_reclaim: true,
            allow_shared_cores_overlap_reclaimed_cores: true,
            cgroup_v2_unified: false,
        };

        let output = assemble_provision(&inputs).unwrap();
        let share_a = output.result.pool_entry("share-a", FAKED_NUMA_ID).unwrap().size;
        let share_b = output.result.pool_entry("share-b", FAKED_NUMA_ID).unwrap().size;
        // expansion fills the budget
        assert_eq!(share_a + share_b, 22);

        let reclaim = output.result.pool_entry(pools::RECLAIM, FAKED_NUMA_ID).unwrap();
        // slack over the knob requirements: 22 - 16 = 6
        assert_eq!(reclaim.size, 6);

        let overlaps = &output.result.pool_overlap_info["reclaim"][&FAKED_NUMA_ID];
        assert_eq!(overlaps.values().sum::<u32>(), 6);
    }

    #[test]
    fn test_budget_property_share_isolation_reserve_within_capacity() {
        let regions = vec![
            share_snapshot("share-a-numa0", "share-a", Some(0), 14.0, 14.0),
            share_snapshot("share-b-numa0", "share-b", Some(0), 12.0, 12.0),
            isolation_snapshot("isolation-pod", Some(0), 5.0, 2.0),
        ];
        let inputs = inputs_on_one_numa(regions, 22, 4);

        let output = assemble_provision(&inputs).unwrap();
        let non_reclaim_total: u32 = output
            .result
            .pool_entries
            .iter()
            .filter(|(pool, _)| *pool != pools::RECLAIM && *pool != pools::RESERVE)
            .flat_map(|(_, entries)| entries.values())
            .map(|r| r.size)
            .sum();
        assert!(non_reclaim_total <= 22);
        // the reclaim floor survives the overcommit
        assert!(output.result.pool_entry(pools::RECLAIM, 0).unwrap().size >= 4);
    }

    #[test]
    fn test_determinism_identical_inputs_identical_outputs() {
        let build = || {
            let regions = vec![
                share_snapshot("share-a", "share-a", None, 9.0, 9.0),
                share_snapshot("share-b", "share-b", None, 7.0, 7.0),
                isolation_snapshot("isolation-pod", None, 4.0, 2.0),
            ];
            AssemblerInputs {
                regions,
                numa_available: BTreeMap::from([(0, 22), (1, 22)]),
                reserved_for_reclaim: BTreeMap::from([(0, 2), (1, 2)]),
                non_binding_numas: NumaSet::from([0, 1]),
                reserve_pool_size: 2,
                enable_reclaim: true,
                allow_shared_cores_overlap_reclaimed_cores: false,
                cgroup_v2_unified: false,
            }
        };

        let a = assemble_provision(&build()).unwrap();
        let b = assemble_provision(&build()).unwrap();
        assert_eq!(a.result.pool_entries, b.result.pool_entries);
        assert_eq!(a.result.pool_overlap_info, b.result.pool_overlap_info);
        assert_eq!(a.throttled, b.throttled);
    }
}
