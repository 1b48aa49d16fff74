//! Load-based pod isolation
//!
//! Tracks a sliding window of per-pod load ratios (1-minute load divided by
//! the pod's cpu request). A pod is isolated once its ratio stays above the
//! threshold for the whole observation period, unless its origin pool opted
//! out. Isolator state survives ticks; metric failures only skip the pod.

use crate::metacache::MetaCache;
use crate::metric::{names, MetricsFetcherRef};
use crate::models::QoSLevel;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Load-to-request ratio above which a pod is considered hot
    pub load_ratio_threshold: f64,
    /// How long the ratio must stay above threshold before isolating
    pub min_duration: Duration,
    /// Sliding window retention for load samples
    pub window: Duration,
    /// Origin pools whose pods are never isolated
    pub disable_pools: BTreeSet<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            load_ratio_threshold: 1.5,
            min_duration: Duration::from_secs(120),
            window: Duration::from_secs(600),
            disable_pools: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PodLoadState {
    samples: VecDeque<(i64, f64)>,
    /// Timestamp of the first over-threshold sample of the current streak
    over_since: Option<i64>,
}

impl PodLoadState {
    fn observe(&mut self, now: i64, ratio: f64, threshold: f64, window_secs: i64) {
        let cutoff = now - window_secs;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, ratio));

        if ratio > threshold {
            self.over_since.get_or_insert(now);
        } else {
            self.over_since = None;
        }
    }

    fn sustained_over(&self, now: i64, min_secs: i64) -> bool {
        match self.over_since {
            Some(since) => now - since >= min_secs,
            None => false,
        }
    }
}

pub struct LoadIsolator {
    config: IsolationConfig,
    metrics: MetricsFetcherRef,
    states: HashMap<String, PodLoadState>,
}

impl LoadIsolator {
    pub fn new(config: IsolationConfig, metrics: MetricsFetcherRef) -> Self {
        Self {
            config,
            metrics,
            states: HashMap::new(),
        }
    }

    /// Pods whose sustained load warrants isolation into their own region
    pub async fn get_isolated_pods(&mut self, cache: &MetaCache) -> BTreeSet<String> {
        let now = chrono::Utc::now().timestamp();

        // aggregate request and origin pool per shared-cores pod
        let mut pod_requests: BTreeMap<String, f64> = BTreeMap::new();
        let mut pod_origin_pools: BTreeMap<String, String> = BTreeMap::new();
        let mut pod_containers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        cache.range_container(|ci| {
            if ci.qos_level == QoSLevel::Shared && !ci.ramp_up {
                *pod_requests.entry(ci.pod_uid.clone()).or_default() += ci.cpu_request;
                pod_origin_pools
                    .entry(ci.pod_uid.clone())
                    .or_insert_with(|| ci.origin_owner_pool_name.clone());
                pod_containers
                    .entry(ci.pod_uid.clone())
                    .or_default()
                    .push(ci.container_name.clone());
            }
            true
        });

        // drop state for pods no longer on the node
        self.states.retain(|uid, _| pod_requests.contains_key(uid));

        for (pod_uid, containers) in &pod_containers {
            let mut load = 0.0;
            let mut complete = true;
            for container in containers {
                match self
                    .metrics
                    .get_container_metric(pod_uid, container, names::CPU_LOAD_1MIN_CONTAINER, None)
                    .await
                {
                    Ok(data) => load += data.value,
                    Err(e) => {
                        debug!(pod = %pod_uid, container = %container, error = %e,
                            "load metric unavailable, skipping pod this tick");
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }

            let request = pod_requests.get(pod_uid).copied().unwrap_or(0.0);
            let ratio = load / request.max(1.0);
            self.states.entry(pod_uid.clone()).or_default().observe(
                now,
                ratio,
                self.config.load_ratio_threshold,
                self.config.window.as_secs() as i64,
            );
        }

        self.isolated_at(now, &pod_origin_pools)
    }

    fn isolated_at(
        &self,
        now: i64,
        pod_origin_pools: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        let min_secs = self.config.min_duration.as_secs() as i64;
        self.states
            .iter()
            .filter(|(uid, state)| {
                let pool_disabled = pod_origin_pools
                    .get(*uid)
                    .map(|pool| self.config.disable_pools.contains(pool))
                    .unwrap_or(false);
                !pool_disabled && state.sustained_over(now, min_secs)
            })
            .map(|(uid, _)| uid.clone())
            .collect()
    }
}
