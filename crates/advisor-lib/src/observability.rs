//! Prometheus metrics for the advisor
//!
//! All advisor series are registered once against the global registry and
//! accessed through a lightweight cloneable handle.

use crate::models::{pools, CpuCalculationResult};
use prometheus::{
    register_gauge, register_gauge_vec, register_int_gauge_vec, Gauge, GaugeVec, IntGaugeVec,
};
use std::sync::OnceLock;

static GLOBAL_METRICS: OnceLock<AdvisorMetricsInner> = OnceLock::new();

struct AdvisorMetricsInner {
    pool_size: GaugeVec,
    pool_quota: GaugeVec,
    update_duration_ms: Gauge,
    region_status: IntGaugeVec,
    indicator_target: GaugeVec,
    indicator_current: GaugeVec,
    indicator_error: GaugeVec,
    memory_headroom_bytes: GaugeVec,
}

impl AdvisorMetricsInner {
    fn new() -> Self {
        Self {
            pool_size: register_gauge_vec!(
                "cpu_advisor_pool_size",
                "Advised cpu pool size per NUMA node",
                &["name", "numa_id", "pool_type"]
            )
            .expect("Failed to register cpu_advisor_pool_size"),

            pool_quota: register_gauge_vec!(
                "cpu_advisor_pool_quota",
                "Advised cpu pool quota per NUMA node",
                &["name", "numa_id", "pool_type"]
            )
            .expect("Failed to register cpu_advisor_pool_quota"),

            update_duration_ms: register_gauge!(
                "cpu_advisor_update_duration",
                "Duration of the last advisor update in milliseconds"
            )
            .expect("Failed to register cpu_advisor_update_duration"),

            region_status: register_int_gauge_vec!(
                "region_status",
                "Live regions and their throttle state",
                &["region", "type", "throttled"]
            )
            .expect("Failed to register region_status"),

            indicator_target: register_gauge_vec!(
                "region_indicator_target",
                "Target value of a region control indicator",
                &["region", "indicator"]
            )
            .expect("Failed to register region_indicator_target"),

            indicator_current: register_gauge_vec!(
                "region_indicator_current",
                "Observed value of a region control indicator",
                &["region", "indicator"]
            )
            .expect("Failed to register region_indicator_current"),

            indicator_error: register_gauge_vec!(
                "region_indicator_error",
                "Observed minus target value of a region control indicator",
                &["region", "indicator"]
            )
            .expect("Failed to register region_indicator_error"),

            memory_headroom_bytes: register_gauge_vec!(
                "memory_advisor_headroom_bytes",
                "Reclaimable memory per NUMA node",
                &["numa_id"]
            )
            .expect("Failed to register memory_advisor_headroom_bytes"),
        }
    }
}

/// Handle to the global advisor metrics
#[derive(Clone, Default)]
pub struct AdvisorMetrics {
    _private: (),
}

impl AdvisorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AdvisorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AdvisorMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Export every pool entry of a calculation result
    pub fn record_pool_entries(&self, result: &CpuCalculationResult) {
        for (pool_name, entries) in &result.pool_entries {
            let pool_type = pools::pool_type(pool_name);
            for (numa_id, resource) in entries {
                let numa = numa_id.to_string();
                self.inner()
                    .pool_size
                    .with_label_values(&[pool_name, &numa, pool_type])
                    .set(resource.size as f64);
                self.inner()
                    .pool_quota
                    .with_label_values(&[pool_name, &numa, pool_type])
                    .set(resource.quota);
            }
        }
    }

    pub fn observe_update_duration_ms(&self, millis: f64) {
        self.inner().update_duration_ms.set(millis);
    }

    pub fn record_region_status(&self, region: &str, region_type: &str, throttled: bool) {
        self.inner()
            .region_status
            .with_label_values(&[region, region_type, if throttled { "true" } else { "false" }])
            .set(1);
    }

    pub fn record_indicator(&self, region: &str, indicator: &str, target: f64, current: f64) {
        self.inner()
            .indicator_target
            .with_label_values(&[region, indicator])
            .set(target);
        self.inner()
            .indicator_current
            .with_label_values(&[region, indicator])
            .set(current);
        self.inner()
            .indicator_error
            .with_label_values(&[region, indicator])
            .set(current - target);
    }

    pub fn record_memory_headroom(&self, numa_id: i32, bytes: f64) {
        self.inner()
            .memory_headroom_bytes
            .with_label_values(&[&numa_id.to_string()])
            .set(bytes);
    }
}
