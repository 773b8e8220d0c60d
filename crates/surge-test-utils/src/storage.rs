//! State store wrapper with fault injection and call tracing.
//!
//! Faults are injected before the call reaches the wrapped store, so a
//! failed call never has a partial effect and is always safe to retry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use surge_control::error::{Error, Result};
use surge_control::events::{ControlEvent, EventDraft};
use surge_control::heartbeat::WorkerHeartbeat;
use surge_control::run::{RunPhase, RunRecord};
use surge_control::scaling::step::StepRecord;
use surge_control::snapshot::WorkerSnapshot;
use surge_control::store::{CasResult, StateStore};
use surge_core::{RunId, WorkerId};

use crate::simulation::FaultConfig;

/// Record of a store call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    /// Trait method that was called.
    pub operation: &'static str,
    /// Whether the call was failed by injection.
    pub injected_fault: bool,
}

/// Store wrapper that fails calls with transient errors.
#[derive(Debug)]
pub struct FaultInjectingStore {
    inner: Arc<dyn StateStore>,
    config: FaultConfig,
    rng: Mutex<StdRng>,
    fail_next: AtomicU32,
    fail_operations: Mutex<BTreeSet<&'static str>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl FaultInjectingStore {
    /// Wraps `inner` with the given random fault rates.
    #[must_use]
    pub fn new(inner: Arc<dyn StateStore>, config: FaultConfig) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            fail_next: AtomicU32::new(0),
            fail_operations: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `n` calls, whatever they are.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every call of `operation` until cleared.
    pub fn fail_operation(&self, operation: &'static str) {
        self.fail_operations.lock().expect("lock").insert(operation);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.fail_operations.lock().expect("lock").clear();
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Number of calls failed by injection.
    #[must_use]
    pub fn injected_faults(&self) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|c| c.injected_fault)
            .count()
    }

    fn check(&self, operation: &'static str, write: bool) -> Result<()> {
        let forced = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let targeted = self
            .fail_operations
            .lock()
            .expect("lock")
            .contains(operation);
        let rate = if write {
            self.config.write_failure_rate
        } else {
            self.config.read_failure_rate
        };
        let random = rate > 0.0 && self.rng.lock().expect("lock").gen_bool(rate.min(1.0));

        let injected_fault = forced || targeted || random;
        self.calls.lock().expect("lock").push(StoreCall {
            operation,
            injected_fault,
        });
        if injected_fault {
            return Err(Error::transient(format!("injected fault in {operation}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultInjectingStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.check("create_run", true)?;
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        self.check("get_run", false)?;
        self.inner.get_run(run_id).await
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.check("update_run", true)?;
        self.inner.update_run(run).await
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        self.check("list_active_runs", false)?;
        self.inner.list_active_runs().await
    }

    async fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<ControlEvent> {
        self.check("append_event", true)?;
        self.inner.append_event(run_id, draft).await
    }

    async fn poll_events_since(
        &self,
        run_id: &RunId,
        last_seen: u64,
    ) -> Result<Vec<ControlEvent>> {
        self.check("poll_events_since", false)?;
        self.inner.poll_events_since(run_id, last_seen).await
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        self.check("upsert_heartbeat", true)?;
        self.inner.upsert_heartbeat(heartbeat).await
    }

    async fn list_heartbeats(&self, run_id: &RunId) -> Result<Vec<WorkerHeartbeat>> {
        self.check("list_heartbeats", false)?;
        self.inner.list_heartbeats(run_id).await
    }

    async fn mark_worker_dead(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        observed_last_heartbeat: DateTime<Utc>,
    ) -> Result<CasResult> {
        self.check("mark_worker_dead", true)?;
        self.inner
            .mark_worker_dead(run_id, worker_id, observed_last_heartbeat)
            .await
    }

    async fn append_snapshot(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        self.check("append_snapshot", true)?;
        self.inner.append_snapshot(snapshot).await
    }

    async fn latest_snapshot_per_worker(
        &self,
        run_id: &RunId,
        phase: Option<RunPhase>,
    ) -> Result<Vec<WorkerSnapshot>> {
        self.check("latest_snapshot_per_worker", false)?;
        self.inner.latest_snapshot_per_worker(run_id, phase).await
    }

    async fn list_snapshots(&self, run_id: &RunId) -> Result<Vec<WorkerSnapshot>> {
        self.check("list_snapshots", false)?;
        self.inner.list_snapshots(run_id).await
    }

    async fn append_step_record(&self, record: &StepRecord) -> Result<()> {
        self.check("append_step_record", true)?;
        self.inner.append_step_record(record).await
    }

    async fn list_step_records(&self, run_id: &RunId) -> Result<Vec<StepRecord>> {
        self.check("list_step_records", false)?;
        self.inner.list_step_records(run_id).await
    }
}
