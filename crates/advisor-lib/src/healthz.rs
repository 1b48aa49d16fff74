//! Health check registry
//!
//! Two registration modes. In heartbeat mode the owner must refresh the
//! check within `timeout_period`; a state other than Ready is tolerated for
//! `toleration_period` before the check turns unready. In report mode the
//! owner only reports failures, and the check auto-recovers once no failure
//! has been reported for `timeout_period`. Temporary registrations carry a
//! reference count so shared checks survive partial unregistration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Check names owned by the advisor components
pub mod checks {
    pub const CPU_ADVISOR_UPDATE: &str = "cpu_advisor_update";
    pub const MEMORY_ADVISOR_UPDATE: &str = "memory_advisor_update";
    pub const CPUSET_CHECK: &str = "cpuset_check";
    pub const RESIDUAL_GC: &str = "residual_gc";
    pub const SYNC_CPU_IDLE: &str = "sync_cpu_idle";
    pub const CHECKPOINT_RECOVERY: &str = "checkpoint_recovery";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckState {
    Ready,
    NotReady,
    Unknown,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckMode {
    Heartbeat,
    Report,
}

/// Readiness verdict for one registered check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
struct CheckStatus {
    state: HealthCheckState,
    message: String,
    mode: HealthCheckMode,
    last_update: DateTime<Utc>,
    unhealthy_start: DateTime<Utc>,
    /// Zero or negative disables the staleness check
    timeout_period: Duration,
    /// Zero or negative means any non-ready state is immediately unready
    toleration_period: Duration,
    temporary: bool,
    refcount: u32,
}

impl CheckStatus {
    fn update(&mut self, state: HealthCheckState, message: impl Into<String>) {
        let now = Utc::now();
        self.message = message.into();
        self.last_update = now;
        if self.state == HealthCheckState::Ready && state != HealthCheckState::Ready {
            self.unhealthy_start = now;
        }
        self.state = state;
    }
}

/// Cloneable handle over the shared check map
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checks: Arc<RwLock<HashMap<String, CheckStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_heartbeat_check(
        &self,
        name: &str,
        timeout_period: Duration,
        init_state: HealthCheckState,
        toleration_period: Duration,
    ) {
        let mut checks = self.checks.write().await;
        if let Some(existing) = checks.get(name) {
            if existing.mode != HealthCheckMode::Heartbeat {
                warn!(check = name, "cannot change mode of an existing check");
            }
            return;
        }
        checks.insert(
            name.to_string(),
            CheckStatus {
                state: init_state,
                message: "Init".to_string(),
                mode: HealthCheckMode::Heartbeat,
                last_update: Utc::now(),
                unhealthy_start: Utc::now(),
                timeout_period,
                toleration_period,
                temporary: false,
                refcount: 0,
            },
        );
    }

    /// Temporary heartbeat checks are refcounted; re-registration under the
    /// same name bumps the count instead of resetting state
    pub async fn register_temporary_heartbeat_check(
        &self,
        name: &str,
        timeout_period: Duration,
        init_state: HealthCheckState,
        toleration_period: Duration,
    ) {
        let mut checks = self.checks.write().await;
        if let Some(existing) = checks.get_mut(name) {
            if !existing.temporary {
                warn!(check = name, "cannot shadow a permanent check with a temporary one");
                return;
            }
            existing.refcount += 1;
            info!(check = name, refcount = existing.refcount, "temporary check re-registered");
            return;
        }
        checks.insert(
            name.to_string(),
            CheckStatus {
                state: init_state,
                message: "Init".to_string(),
                mode: HealthCheckMode::Heartbeat,
                last_update: Utc::now(),
                unhealthy_start: Utc::now(),
                timeout_period,
                toleration_period,
                temporary: true,
                refcount: 1,
            },
        );
    }

    pub async fn unregister_temporary_heartbeat_check(&self, name: &str) {
        let mut checks = self.checks.write().await;
        let Some(existing) = checks.get_mut(name) else {
            return;
        };
        if !existing.temporary {
            warn!(check = name, "refusing to unregister a permanent check");
            return;
        }
        existing.refcount = existing.refcount.saturating_sub(1);
        if existing.refcount == 0 {
            checks.remove(name);
        }
    }

    pub async fn register_report_check(
        &self,
        name: &str,
        timeout_period: Duration,
        init_state: HealthCheckState,
    ) {
        let mut checks = self.checks.write().await;
        if let Some(existing) = checks.get(name) {
            if existing.mode != HealthCheckMode::Report {
                warn!(check = name, "cannot change mode of an existing check");
            }
            return;
        }
        checks.insert(
            name.to_string(),
            CheckStatus {
                state: init_state,
                message: "Init".to_string(),
                mode: HealthCheckMode::Report,
                last_update: Utc::now(),
                unhealthy_start: Utc::now(),
                timeout_period,
                toleration_period: Duration::zero(),
                temporary: false,
                refcount: 0,
            },
        );
    }

    pub async fn update_state(
        &self,
        name: &str,
        state: HealthCheckState,
        message: impl Into<String>,
    ) {
        let mut checks = self.checks.write().await;
        match checks.get_mut(name) {
            Some(status) => status.update(state, message),
            None => warn!(check = name, "update for an unregistered check"),
        }
    }

    /// Heartbeat helper: Ready on success, NotReady with the error text
    pub async fn update_by_error(&self, name: &str, err: Option<&anyhow::Error>) {
        match err {
            Some(e) => {
                self.update_state(name, HealthCheckState::NotReady, e.to_string())
                    .await
            }
            None => self.update_state(name, HealthCheckState::Ready, "").await,
        }
    }

    /// Evaluate every registered check against its mode's readiness rules
    pub async fn results(&self) -> BTreeMap<String, HealthCheckResult> {
        let now = Utc::now();
        let checks = self.checks.read().await;
        let mut results = BTreeMap::new();
        for (name, status) in checks.iter() {
            let mut ready = true;
            let mut message = status.message.clone();
            match status.mode {
                HealthCheckMode::Heartbeat => {
                    if status.timeout_period > Duration::zero()
                        && now - status.last_update > status.timeout_period
                    {
                        ready = false;
                        message = format!(
                            "no heartbeat for more than {}s, last update {}",
                            status.timeout_period.num_seconds(),
                            status.last_update
                        );
                    }
                    if status.state != HealthCheckState::Ready {
                        if status.toleration_period <= Duration::zero()
                            || now - status.unhealthy_start > status.toleration_period
                        {
                            ready = false;
                        }
                    }
                }
                HealthCheckMode::Report => {
                    ready = status.state == HealthCheckState::Ready;
                    if !ready
                        && status.timeout_period > Duration::zero()
                        && now - status.last_update > status.timeout_period
                    {
                        // no new failure reported: consider the exception recovered
                        ready = true;
                        message = "auto-recovered".to_string();
                    }
                }
            }
            results.insert(name.clone(), HealthCheckResult { ready, message });
        }
        results
    }

    /// The process is ready when every registered check is ready
    pub async fn is_ready(&self) -> bool {
        self.results().await.values().all(|r| r.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_ready_after_update() {
        let registry = HealthRegistry::new();
        registry
            .register_heartbeat_check(
                checks::CPU_ADVISOR_UPDATE,
                Duration::seconds(60),
                HealthCheckState::Ready,
                Duration::seconds(30),
            )
            .await;

        registry.update_by_error(checks::CPU_ADVISOR_UPDATE, None).await;
        assert!(registry.is_ready().await);
    }

    #[tokio::test]
    async fn test_heartbeat_tolerates_not_ready_within_period() {
        let registry = HealthRegistry::new();
        registry
            .register_heartbeat_check(
                "tick",
                Duration::seconds(60),
                HealthCheckState::Ready,
                Duration::seconds(30),
            )
            .await;

        let err = anyhow::anyhow!("metric fetch failed");
        registry.update_by_error("tick", Some(&err)).await;

        // the failure is fresh, still inside the toleration window
        let results = registry.results().await;
        assert!(results["tick"].ready);
    }

    #[tokio::test]
    async fn test_heartbeat_zero_toleration_fails_immediately() {
        let registry = HealthRegistry::new();
        registry
            .register_heartbeat_check(
                "tick",
                Duration::seconds(60),
                HealthCheckState::Ready,
                Duration::zero(),
            )
            .await;

        registry
            .update_state("tick", HealthCheckState::NotReady, "boom")
            .await;
        assert!(!registry.is_ready().await);
    }

    #[tokio::test]
    async fn test_report_mode_not_ready_on_failure() {
        let registry = HealthRegistry::new();
        registry
            .register_report_check("gc", Duration::seconds(300), HealthCheckState::Ready)
            .await;

        registry
            .update_state("gc", HealthCheckState::Failed, "residual cleanup failed")
            .await;
        let results = registry.results().await;
        assert!(!results["gc"].ready);
        assert_eq!(results["gc"].message, "residual cleanup failed");
    }

    #[tokio::test]
    async fn test_temporary_check_refcounting() {
        let registry = HealthRegistry::new();
        registry
            .register_temporary_heartbeat_check(
                "probe",
                Duration::seconds(10),
                HealthCheckState::Ready,
                Duration::zero(),
            )
            .await;
        registry
            .register_temporary_heartbeat_check(
                "probe",
                Duration::seconds(10),
                HealthCheckState::Ready,
                Duration::zero(),
            )
            .await;

        registry.unregister_temporary_heartbeat_check("probe").await;
        assert!(registry.results().await.contains_key("probe"));

        registry.unregister_temporary_heartbeat_check("probe").await;
        assert!(!registry.results().await.contains_key("probe"));
    }

    #[tokio::test]
    async fn test_mode_change_is_rejected() {
        let registry = HealthRegistry::new();
        registry
            .register_heartbeat_check(
                "tick",
                Duration::seconds(60),
                HealthCheckState::Ready,
                Duration::zero(),
            )
            .await;
        registry
            .register_report_check("tick", Duration::seconds(60), HealthCheckState::Failed)
            .await;

        // original heartbeat registration survives
        assert!(registry.is_ready().await);
    }
}
