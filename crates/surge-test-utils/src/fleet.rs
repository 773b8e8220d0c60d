//! In-process worker fleet that follows the control protocol.
//!
//! [`SimulatedFleet`] is a [`WorkerSpawner`]. Every spawned worker gets a
//! heartbeat row and an [`EventCursor`]; [`SimulatedFleet::sync`] plays one
//! worker poll cycle for the whole fleet: read events, apply the in-scope
//! ones in order, read the run record, check the [`ExitPolicy`], heartbeat.
//! Snapshots are only written when a test asks for them, so the test
//! controls exactly what the orchestrator measures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::Instrument;

use surge_control::clock::Clock;
use surge_control::error::{Error, Result};
use surge_control::events::EventPayload;
use surge_control::heartbeat::{ResourceUsage, WorkerHeartbeat, WorkerStatus};
use surge_control::run::{RunPhase, RunRecord, RunStatus};
use surge_control::snapshot::{LatencyStats, WorkerSnapshot};
use surge_control::spawner::{SpawnRequest, WorkerSpawner};
use surge_control::store::StateStore;
use surge_control::worker_contract::{
    EventCursor, ExitCondition, ExitPolicy, WorkerObservation, fallback_target, is_stop,
};
use surge_core::observability::worker_span;
use surge_core::{WorkerGroupId, WorkerId};

/// Exit rules every simulated worker follows.
const EXIT_POLICY: ExitPolicy = ExitPolicy {
    registration_timeout: Duration::from_secs(300),
    no_connection_timeout: Duration::from_secs(60),
};

/// One interval report from one simulated worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerReport {
    /// Throughput over the interval; also the number of operations added.
    pub qps: f64,
    /// P95 latency over the interval, milliseconds.
    pub p95_ms: f64,
    /// Failed operations added this interval.
    pub errors: u64,
}

impl WorkerReport {
    /// An error-free report.
    pub const fn new(qps: f64, p95_ms: f64) -> Self {
        Self {
            qps,
            p95_ms,
            errors: 0,
        }
    }

    /// Sets the failed operations of this interval.
    #[must_use]
    pub const fn with_errors(mut self, errors: u64) -> Self {
        self.errors = errors;
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseTotals {
    ops: u64,
    reads: u64,
    writes: u64,
    errors: u64,
}

#[derive(Debug)]
struct SimWorker {
    heartbeat: WorkerHeartbeat,
    cursor: EventCursor,
    registered_at: DateTime<Utc>,
    totals: BTreeMap<RunPhase, PhaseTotals>,
    silenced: bool,
    missing_events: bool,
    stop_received: bool,
    exit: Option<ExitCondition>,
}

impl SimWorker {
    fn apply(&mut self, payload: &EventPayload) {
        if is_stop(payload) {
            self.stop_received = true;
        }
        let hb = &mut self.heartbeat;
        match payload {
            EventPayload::Start { phase } => {
                hb.status = WorkerStatus::Running;
                hb.phase = *phase;
            }
            EventPayload::SetPhase { phase } => hb.phase = *phase,
            EventPayload::SetWorkerTarget { target_connections }
            | EventPayload::ScaleDown {
                target_connections, ..
            } => {
                hb.target_connections = *target_connections;
                hb.active_connections = *target_connections;
            }
            EventPayload::Stop { .. } => hb.status = WorkerStatus::Draining,
            EventPayload::GuardrailWarning { .. } => {}
        }
    }

    /// Rebuilds phase, status and target from the run record after a
    /// batch of events was lost.
    fn recover(&mut self, run: &RunRecord) {
        let hb = &mut self.heartbeat;
        if run.phase > hb.phase {
            hb.phase = run.phase;
        }
        match run.status {
            RunStatus::Running if hb.status == WorkerStatus::Waiting => {
                hb.status = WorkerStatus::Running;
            }
            RunStatus::Cancelling => {
                self.stop_received = true;
                hb.status = WorkerStatus::Draining;
            }
            _ => {}
        }
        if let Some(target) = fallback_target(run, &hb.worker_id, hb.worker_group_id) {
            hb.target_connections = target;
            hb.active_connections = target;
        }
    }

    /// Acts on an exit condition. A held drain keeps the worker draining.
    fn conclude(&mut self, condition: ExitCondition, hold_drain: bool) {
        if condition == ExitCondition::StopReceived && hold_drain {
            return;
        }
        self.heartbeat.status = WorkerStatus::Completed;
        self.heartbeat.active_connections = 0;
        self.exit = Some(condition);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn snapshot(&mut self, report: WorkerReport, now: chrono::DateTime<chrono::Utc>) -> WorkerSnapshot {
        let hb = &self.heartbeat;
        let totals = self.totals.entry(hb.phase).or_default();
        let ops = report.qps.max(0.0).round() as u64;
        totals.ops += ops;
        totals.reads += ops - ops / 2;
        totals.writes += ops / 2;
        totals.errors += report.errors;

        WorkerSnapshot {
            run_id: hb.run_id,
            worker_id: hb.worker_id.clone(),
            worker_group_id: hb.worker_group_id,
            timestamp: now,
            phase: hb.phase,
            total_ops: totals.ops,
            read_count: totals.reads,
            write_count: totals.writes,
            error_count: totals.errors,
            qps: report.qps,
            latency: LatencyStats {
                p50: report.p95_ms / 2.0,
                p95: report.p95_ms,
                p99: report.p95_ms * 1.5,
                avg: report.p95_ms / 2.0,
                min: report.p95_ms / 10.0,
                max: report.p95_ms * 2.0,
            },
            active_connections: hb.active_connections,
            target_connections: hb.target_connections,
        }
    }
}

/// Worker id the fleet gives the worker in `slot`.
pub fn worker_id_for(slot: WorkerGroupId) -> WorkerId {
    WorkerId::new(format!("worker-{}", slot.get()))
}

/// In-process fleet driven by the test.
#[derive(Debug)]
pub struct SimulatedFleet {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    workers: AsyncMutex<BTreeMap<WorkerId, SimWorker>>,
    spawned: Mutex<Vec<SpawnRequest>>,
    register_on_spawn: AtomicBool,
    fail_spawns: AtomicBool,
    hold_drain: AtomicBool,
}

impl SimulatedFleet {
    /// A fleet whose workers register as soon as they are spawned.
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            workers: AsyncMutex::new(BTreeMap::new()),
            spawned: Mutex::new(Vec::new()),
            register_on_spawn: AtomicBool::new(true),
            fail_spawns: AtomicBool::new(false),
            hold_drain: AtomicBool::new(false),
        }
    }

    /// Spawned workers stay silent until [`SimulatedFleet::register`].
    #[must_use]
    pub fn without_registration(self) -> Self {
        self.register_on_spawn.store(false, Ordering::SeqCst);
        self
    }

    /// Rejects or accepts subsequent spawn requests.
    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// While held, a `STOP` leaves workers `DRAINING` instead of exiting.
    pub fn set_hold_drain(&self, hold: bool) {
        self.hold_drain.store(hold, Ordering::SeqCst);
    }

    /// Every accepted spawn request, in order.
    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().expect("lock").clone()
    }

    /// Ids of registered workers, ascending.
    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.lock().await.keys().cloned().collect()
    }

    /// The fleet's local view of a worker's heartbeat.
    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Option<WorkerHeartbeat> {
        self.workers
            .lock()
            .await
            .get(worker_id)
            .map(|w| w.heartbeat.clone())
    }

    /// Why a worker exited, if it did.
    pub async fn exit_condition(&self, worker_id: &WorkerId) -> Option<ExitCondition> {
        self.workers
            .lock()
            .await
            .get(worker_id)
            .and_then(|w| w.exit)
    }

    /// Registers the worker of a spawn request by writing its first heartbeat.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn register(&self, request: SpawnRequest) -> Result<WorkerId> {
        let worker_id = worker_id_for(request.worker_group_id);
        let now = self.clock.now();
        let heartbeat = WorkerHeartbeat::registered(
            request.run_id,
            worker_id.clone(),
            request.worker_group_id,
            now,
        );
        self.store.upsert_heartbeat(&heartbeat).await?;
        self.workers.lock().await.insert(
            worker_id.clone(),
            SimWorker {
                cursor: EventCursor::new(worker_id.clone(), request.worker_group_id),
                heartbeat,
                registered_at: now,
                totals: BTreeMap::new(),
                silenced: false,
                missing_events: false,
                stop_received: false,
                exit: None,
            },
        );
        Ok(worker_id)
    }

    /// Stops a worker from heartbeating or reporting, as if it crashed.
    pub async fn silence(&self, worker_id: &WorkerId) {
        if let Some(worker) = self.workers.lock().await.get_mut(worker_id) {
            worker.silenced = true;
        }
    }

    /// Drops the next batch of events a worker polls, as if the read was
    /// lost. The worker falls back to the run record on that cycle.
    pub async fn miss_events(&self, worker_id: &WorkerId) {
        if let Some(worker) = self.workers.lock().await.get_mut(worker_id) {
            worker.missing_events = true;
        }
    }

    /// Sets the resource usage a worker reports on its next heartbeat.
    pub async fn set_resources(&self, worker_id: &WorkerId, usage: ResourceUsage) {
        if let Some(worker) = self.workers.lock().await.get_mut(worker_id) {
            worker.heartbeat.resources = Some(usage);
        }
    }

    /// Sets the resource usage of every worker.
    pub async fn set_all_resources(&self, usage: ResourceUsage) {
        for worker in self.workers.lock().await.values_mut() {
            worker.heartbeat.resources = Some(usage);
        }
    }

    /// One poll cycle for every live worker: apply new events, read the run
    /// record, heartbeat.
    ///
    /// A worker that meets an exit condition heartbeats `COMPLETED` once
    /// more and then exits.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub async fn sync(&self) -> Result<()> {
        let now = self.clock.now();
        let hold_drain = self.hold_drain.load(Ordering::SeqCst);
        let mut workers = self.workers.lock().await;

        for worker in workers.values_mut() {
            if worker.silenced || worker.exit.is_some() {
                continue;
            }
            let run_id = worker.heartbeat.run_id;
            let span = worker_span(
                "sync",
                &run_id.to_string(),
                worker.heartbeat.worker_id.as_str(),
            );

            let events = self
                .store
                .poll_events_since(&run_id, worker.cursor.last_seen())
                .instrument(span.clone())
                .await?;
            let accepted = worker.cursor.accept(events);
            let run = self
                .store
                .get_run(&run_id)
                .instrument(span.clone())
                .await?;

            if std::mem::take(&mut worker.missing_events) {
                tracing::debug!(
                    worker_id = %worker.heartbeat.worker_id,
                    dropped = accepted.len(),
                    "simulated worker lost an event batch"
                );
                if let Some(run) = &run {
                    worker.recover(run);
                }
            } else {
                for event in accepted {
                    tracing::trace!(
                        worker_id = %worker.heartbeat.worker_id,
                        sequence_id = event.sequence_id,
                        event_type = %event.event_type,
                        "simulated worker applying event"
                    );
                    worker.apply(&event.payload);
                }
            }

            let observation = WorkerObservation {
                stop_received: worker.stop_received,
                registered_at: worker.registered_at,
                run_status: run.map(|r| r.status),
                last_store_contact: now,
            };
            if let Some(condition) = EXIT_POLICY.check(&observation, now) {
                worker.conclude(condition, hold_drain);
            }
            worker.heartbeat.last_heartbeat = now;
            self.store
                .upsert_heartbeat(&worker.heartbeat)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    /// Writes one snapshot for a single running worker.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or non-running worker, or the store
    /// error.
    pub async fn report(&self, worker_id: &WorkerId, report: WorkerReport) -> Result<()> {
        let now = self.clock.now();
        let mut workers = self.workers.lock().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            return Err(Error::storage(format!("unknown worker {worker_id}")));
        };
        if worker.silenced || worker.heartbeat.status != WorkerStatus::Running {
            return Err(Error::WorkerNotFound {
                run_id: worker.heartbeat.run_id,
                worker_id: worker_id.clone(),
            });
        }
        let snapshot = worker.snapshot(report, now);
        self.store.append_snapshot(&snapshot).await
    }

    /// Writes one snapshot per running worker, splitting `fleet_qps`
    /// evenly. Returns how many workers reported.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    #[allow(clippy::cast_precision_loss)]
    pub async fn report_all(&self, fleet_qps: f64, p95_ms: f64) -> Result<usize> {
        let now = self.clock.now();
        let mut workers = self.workers.lock().await;
        let mut reporting: Vec<&mut SimWorker> = workers
            .values_mut()
            .filter(|w| !w.silenced && w.heartbeat.status == WorkerStatus::Running)
            .collect();
        if reporting.is_empty() {
            return Ok(0);
        }

        let per_worker = WorkerReport::new(fleet_qps / reporting.len() as f64, p95_ms);
        for worker in &mut reporting {
            let snapshot = worker.snapshot(per_worker, now);
            self.store.append_snapshot(&snapshot).await?;
        }
        Ok(reporting.len())
    }
}

#[async_trait]
impl WorkerSpawner for SimulatedFleet {
    async fn spawn(&self, request: SpawnRequest) -> Result<()> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(Error::spawn(format!(
                "no capacity for slot {}",
                request.worker_group_id
            )));
        }
        self.spawned.lock().expect("lock").push(request);
        if self.register_on_spawn.load(Ordering::SeqCst) {
            self.register(request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedClock;
    use surge_control::config::ScenarioConfig;
    use surge_control::events::{EventDraft, EventScope};
    use surge_control::run::RunRecord;
    use surge_control::store::memory::InMemoryStateStore;
    use surge_core::RunId;

    #[tokio::test]
    async fn workers_apply_events_in_scope() -> Result<()> {
        let clock = Arc::new(SimulatedClock::deterministic());
        let store = Arc::new(InMemoryStateStore::new());
        let run = RunRecord::new(RunId::generate(), ScenarioConfig::fixed_total(4, 2), clock.now());
        store.create_run(&run).await?;
        let fleet = SimulatedFleet::new(store.clone(), clock.clone());

        for request in SpawnRequest::fleet(run.run_id, 2) {
            fleet.spawn(request).await?;
        }
        let start = EventDraft::new(
            EventScope::Run,
            EventPayload::Start {
                phase: RunPhase::Warmup,
            },
            clock.now(),
        );
        store.append_event(&run.run_id, start).await?;
        let target = EventDraft::new(
            EventScope::WorkerGroup(WorkerGroupId::new(1)),
            EventPayload::SetWorkerTarget {
                target_connections: 7,
            },
            clock.now(),
        );
        store.append_event(&run.run_id, target).await?;
        fleet.sync().await?;

        let w0 = fleet.heartbeat(&worker_id_for(WorkerGroupId::new(0))).await.unwrap();
        let w1 = fleet.heartbeat(&worker_id_for(WorkerGroupId::new(1))).await.unwrap();
        assert_eq!(w0.status, WorkerStatus::Running);
        assert_eq!(w0.target_connections, 0);
        assert_eq!(w1.target_connections, 7);
        assert_eq!(store.list_heartbeats(&run.run_id).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_counters_are_cumulative_per_phase() -> Result<()> {
        let clock = Arc::new(SimulatedClock::deterministic());
        let store = Arc::new(InMemoryStateStore::new());
        let run = RunRecord::new(RunId::generate(), ScenarioConfig::fixed_total(2, 2), clock.now());
        store.create_run(&run).await?;
        let fleet = SimulatedFleet::new(store.clone(), clock.clone());
        fleet.spawn(SpawnRequest::fleet(run.run_id, 1)[0]).await?;
        let start = EventDraft::new(
            EventScope::Run,
            EventPayload::Start {
                phase: RunPhase::Measurement,
            },
            clock.now(),
        );
        store.append_event(&run.run_id, start).await?;
        fleet.sync().await?;

        fleet.report_all(10.0, 5.0).await?;
        clock.advance(std::time::Duration::from_secs(1));
        fleet.report_all(20.0, 5.0).await?;

        let latest = store.latest_snapshot_per_worker(&run.run_id, None).await?;
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].total_ops, 30);
        assert_eq!(latest[0].read_count + latest[0].write_count, 30);
        Ok(())
    }
}
