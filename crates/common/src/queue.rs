//! Per-run spec queue
//!
//! An unordered set of spec paths. Claiming removes one member at random;
//! returning puts it back. A spec is only ever held by one worker at a time.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::control::ControlPlane;
use crate::Result;

/// Worker-side view of a run's queue
#[async_trait]
pub trait SpecQueue: Send + Sync {
    /// Remove and return one spec, or `None` when the queue is empty.
    async fn claim(&self, run_id: i64, worker_name: &str) -> Result<Option<String>>;

    /// Put a claimed spec back. Returning a spec already present is a no-op.
    async fn return_spec(&self, run_id: i64, spec: &str) -> Result<()>;

    /// Whether the run still exists and has not reached a terminal status.
    async fn is_active(&self, run_id: i64) -> Result<bool>;
}

/// In-process queue keyed by run id
#[derive(Debug, Default)]
pub struct SpecSet {
    runs: Mutex<HashMap<i64, HashSet<String>>>,
}

impl SpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add specs to a run. Paths already queued are not duplicated.
    pub fn enqueue<I, S>(&self, run_id: i64, specs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut runs = self.runs.lock();
        let set = runs.entry(run_id).or_default();
        for spec in specs {
            set.insert(spec.into());
        }
        debug!("Run {} has {} queued specs", run_id, set.len());
    }

    pub fn pending(&self, run_id: i64) -> usize {
        self.runs.lock().get(&run_id).map_or(0, HashSet::len)
    }

    /// Drop the run; later claims see an empty queue and `is_active` turns false.
    pub fn cancel(&self, run_id: i64) {
        self.runs.lock().remove(&run_id);
    }
}

#[async_trait]
impl SpecQueue for SpecSet {
    async fn claim(&self, run_id: i64, worker_name: &str) -> Result<Option<String>> {
        let mut runs = self.runs.lock();
        let Some(set) = runs.get_mut(&run_id) else {
            return Ok(None);
        };
        let picked = set.iter().choose(&mut rand::thread_rng()).cloned();
        if let Some(spec) = &picked {
            set.remove(spec);
            debug!("{} claimed {} from run {}", worker_name, spec, run_id);
        }
        Ok(picked)
    }

    async fn return_spec(&self, run_id: i64, spec: &str) -> Result<()> {
        if let Some(set) = self.runs.lock().get_mut(&run_id) {
            set.insert(spec.to_string());
        }
        Ok(())
    }

    async fn is_active(&self, run_id: i64) -> Result<bool> {
        Ok(self.runs.lock().contains_key(&run_id))
    }
}

/// Queue backed by the control plane's `next-spec` / `return-spec` endpoints
#[derive(Clone)]
pub struct ControlPlaneQueue {
    control: Arc<dyn ControlPlane>,
}

impl ControlPlaneQueue {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SpecQueue for ControlPlaneQueue {
    async fn claim(&self, _run_id: i64, worker_name: &str) -> Result<Option<String>> {
        self.control.next_spec(worker_name).await
    }

    async fn return_spec(&self, _run_id: i64, spec: &str) -> Result<()> {
        self.control.return_spec(spec).await
    }

    async fn is_active(&self, _run_id: i64) -> Result<bool> {
        Ok(self
            .control
            .fetch_testrun()
            .await?
            .is_some_and(|run| !run.status.is_terminal()))
    }
}
