//! Named async worker pool
//!
//! At most one job runs per name. Submitting a job under a running name
//! stores it as the last undelivered job, overwriting any previously pending
//! one; the running job is never preempted. On completion the pending job,
//! if any, is dispatched exactly once.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type WorkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type WorkFn = Box<dyn FnOnce() -> WorkFuture + Send>;

/// A unit of deferred work
pub struct Work {
    fun: WorkFn,
    pub delivered_at: DateTime<Utc>,
}

impl Work {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            fun: Box::new(move || Box::pin(f())),
            delivered_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct WorkerState {
    working: bool,
    last_undelivered: Option<Work>,
}

/// Worker pool keyed on job name
#[derive(Clone)]
pub struct AsyncWorkers {
    pool_name: String,
    states: Arc<Mutex<HashMap<String, WorkerState>>>,
}

impl AsyncWorkers {
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit work under a name. Runs immediately when the name is idle,
    /// otherwise replaces the pending job for that name.
    pub fn add_work(&self, name: &str, work: Work) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(name.to_string()).or_default();
        if state.working {
            if state.last_undelivered.is_some() {
                debug!(pool = %self.pool_name, work = name, "overwriting undelivered work");
            }
            state.last_undelivered = Some(work);
            return;
        }
        state.working = true;
        drop(states);
        self.dispatch(name.to_string(), work);
    }

    /// True while a job with this name is running
    pub fn is_working(&self, name: &str) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.working)
            .unwrap_or(false)
    }

    /// True when a job is queued behind the running one
    pub fn has_undelivered(&self, name: &str) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.last_undelivered.is_some())
            .unwrap_or(false)
    }

    fn dispatch(&self, name: String, work: Work) {
        let workers = self.clone();
        tokio::spawn(async move {
            let mut current = work;
            loop {
                let started = Utc::now();
                if let Err(e) = (current.fun)().await {
                    warn!(
                        pool = %workers.pool_name,
                        work = %name,
                        error = %e,
                        "async work failed"
                    );
                }
                debug!(
                    pool = %workers.pool_name,
                    work = %name,
                    queued_ms = (started - current.delivered_at).num_milliseconds(),
                    "async work finished"
                );

                let mut states = workers.states.lock().unwrap();
                let state = states.entry(name.clone()).or_default();
                match state.last_undelivered.take() {
                    Some(next) => current = next,
                    None => {
                        state.working = false;
                        break;
                    }
                }
            }
        });
    }
}
