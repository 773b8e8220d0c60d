//! Run lifecycle orchestration.
//!
//! The [`Orchestrator`] is the only writer of run records and control
//! events. It owns one poll loop per active run; each tick:
//!
//! 1. sweeps heartbeats, classifies health and applies the worker-failure
//!    policy (or, while cancelling, checks whether the drain is over);
//! 2. advances the phase schedule, emitting `SET_PHASE`;
//! 3. re-aggregates the latest snapshots when new ones arrived;
//! 4. runs the scaling controller for the scenario's load mode;
//! 5. runs the guardrail policy.
//!
//! Every store call goes through the configured [`RetryPolicy`]. When the
//! retries are exhausted the tick fails and the next tick starts over from
//! the stored record; the run itself is unaffected.
//!
//! Run-level failures never surface as errors from these methods. They are
//! recorded on the [`RunRecord`] as a status plus a [`RunReason`].
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

pub mod controller;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use surge_core::observability::run_span;
use surge_core::{RunId, WorkerGroupId};

use crate::aggregation::{AggregateMetrics, SnapshotWatermark, aggregate_final, aggregate_live};
use crate::clock::{Clock, SystemClock};
use crate::config::{OrchestratorConfig, ScenarioConfig};
use crate::error::{Error, Result};
use crate::events::{ControlEvent, EventDraft, EventPayload, EventScope, EventType};
use crate::guardrail::{self, Compensation, GuardrailDecision};
use crate::heartbeat::{ClassifiedWorker, WorkerHealth, WorkerHeartbeat, WorkerStatus, classify_all};
use crate::metrics::{ControlMetrics, time_tick};
use crate::queue_signal::{NoQueueSignal, QueueSignal};
use crate::run::{DrainOutcome, RunPhase, RunReason, RunRecord, RunStatus};
use crate::scaling::step::{StepAction, StepController, StepRecord};
use crate::scaling::throughput::{ThroughputDecision, ThroughputSeeker};
use crate::scaling::{by_group, compute_worker_targets, initial_plan};
use crate::spawner::{SpawnRequest, WorkerSpawner};
use crate::store::{CasResult, StateStore};

use self::controller::{
    AggregationKey, RunController, changed_targets, completion_reason, drain_outcome, due_phase,
    worker_failure, worker_loads,
};

type SharedController = Arc<AsyncMutex<RunController>>;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("orchestrator registry lock poisoned")
}

/// Builder for [`Orchestrator`].
#[derive(Debug)]
pub struct OrchestratorBuilder {
    store: Arc<dyn StateStore>,
    spawner: Arc<dyn WorkerSpawner>,
    queue_signal: Arc<dyn QueueSignal>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Sets the process-level configuration.
    #[must_use]
    pub const fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for every record timestamp.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the external queueing signal read by capacity discovery.
    #[must_use]
    pub fn queue_signal(mut self, queue_signal: Arc<dyn QueueSignal>) -> Self {
        self.queue_signal = queue_signal;
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                spawner: self.spawner,
                queue_signal: self.queue_signal,
                clock: self.clock,
                config: self.config,
                metrics: ControlMetrics::new(),
                controllers: Mutex::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Control plane for load runs.
///
/// Cheap to clone; clones share state.
///
/// ## Example
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(store, spawner, OrchestratorConfig::from_env()?);
/// let run_id = orchestrator.create_run(ScenarioConfig::fixed_total(100, 25)).await?;
/// orchestrator.start_run(&run_id).await?;
/// let run = orchestrator.wait_for_terminal(&run_id, Duration::from_secs(1)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn StateStore>,
    spawner: Arc<dyn WorkerSpawner>,
    queue_signal: Arc<dyn QueueSignal>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    metrics: ControlMetrics,
    controllers: Mutex<HashMap<RunId, SharedController>>,
    loops: Mutex<HashMap<RunId, JoinHandle<()>>>,
}

impl Orchestrator {
    /// Starts a builder with the system clock and no queue signal.
    #[must_use]
    pub fn builder(
        store: Arc<dyn StateStore>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            spawner,
            queue_signal: Arc::new(NoQueueSignal),
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
        }
    }

    /// Creates an orchestrator with the system clock and no queue signal.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        spawner: Arc<dyn WorkerSpawner>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::builder(store, spawner).config(config).build()
    }

    /// The store this orchestrator writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    /// The process-level configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Validates a scenario and inserts a `PREPARED` run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the scenario fails validation,
    /// or a store error.
    #[tracing::instrument(skip(self, scenario), fields(scenario = %scenario.name, mode = scenario.load.as_label()))]
    pub async fn create_run(&self, scenario: ScenarioConfig) -> Result<RunId> {
        scenario.validate()?;
        let run = RunRecord::new(RunId::generate(), scenario, self.inner.clock.now());
        let store = &self.inner.store;
        let record = &run;
        self.inner
            .config
            .retry
            .run("create_run", move || store.create_run(record))
            .await?;
        tracing::info!(run_id = %run.run_id, "run created");
        Ok(run.run_id)
    }

    /// Launches the fleet and, once every worker registered, starts the run.
    ///
    /// A spawn failure or registration timeout leaves the run `FAILED` and
    /// is reported through the returned record, not as an error. No `START`
    /// event is emitted for a run that never started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`], [`Error::InvalidStateTransition`] if
    /// the run is not `PREPARED` or its start is already under way, or a
    /// store error. A store error raised after the run was stored `RUNNING`
    /// leaves it `RUNNING`; the next tick finishes announcing it.
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn start_run(&self, run_id: &RunId) -> Result<RunRecord> {
        let inner = &self.inner;
        let controller = inner.controller(run_id)?;

        let expected_workers = {
            let _guard = controller.lock().await;
            let mut run = inner.load_controlled(run_id).await?;
            if run.status != RunStatus::Prepared || run.expected_workers > 0 {
                if run.is_terminal() {
                    inner.forget(run_id);
                }
                return Err(Error::InvalidStateTransition {
                    from: run.status.to_string(),
                    to: RunStatus::Running.to_string(),
                    reason: "run is not waiting to be started".into(),
                });
            }
            let plan = initial_plan(&run.scenario)?;
            run.expected_workers = plan.worker_count;
            for (group, target) in plan.targets {
                run.set_group_target(group, target);
            }
            run.updated_at = inner.clock.now();
            inner.save_run(&run).await?;
            run.expected_workers
        };

        for request in SpawnRequest::fleet(*run_id, expected_workers) {
            if let Err(err) = inner.spawner.spawn(request).await {
                tracing::error!(worker_group_id = %request.worker_group_id, error = %err, "worker spawn failed");
                let message = format!("slot {}: {err}", request.worker_group_id);
                let _guard = controller.lock().await;
                return inner
                    .fail_before_start(run_id, RunReason::SpawnFailed, message)
                    .await;
            }
        }
        tracing::info!(expected_workers, "fleet launched, waiting for registration");

        let timeout = inner.config.registration_timeout;
        let registered =
            tokio::time::timeout(timeout, inner.await_registration(run_id, expected_workers))
                .await
                .ok();

        let _guard = controller.lock().await;
        let Some(heartbeats) = registered else {
            let seen = inner.heartbeats(run_id).await.map_or(0, |hbs| hbs.len());
            let message = format!(
                "{seen} of {expected_workers} workers registered within {}s",
                timeout.as_secs()
            );
            return inner
                .fail_before_start(run_id, RunReason::RegistrationTimeout, message)
                .await;
        };

        let mut run = inner.load_controlled(run_id).await?;
        if run.status != RunStatus::Prepared {
            tracing::info!(status = %run.status, "run left PREPARED while registering");
            return Ok(run);
        }

        let now = inner.clock.now();
        run.registered_workers = count(heartbeats.len());
        run.mirror_worker_targets(&heartbeats);
        run.transition_to(RunStatus::Running, now)?;
        run.advance_phase(RunPhase::Warmup, now)?;
        inner.save_run(&run).await?;
        tracing::info!(
            registered_workers = run.registered_workers,
            total_connections = run.total_target_connections(),
            "run started"
        );

        // Once RUNNING is stored the poll loop owns the run. If the
        // announcement below fails, the next tick repeats it.
        if inner.config.autostart_poll_loop {
            self.spawn_poll_loop(*run_id)?;
        }
        inner.announce_start(&mut run, now).await?;
        inner.save_run(&run).await?;
        Ok(run)
    }

    /// Requests a two-phase stop.
    ///
    /// Appends a `STOP` event and moves the run to `CANCELLING`; the poll
    /// loop later moves it to `CANCELLED`. A run that never started is
    /// cancelled at once. Calling this again, or on a terminal run, is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a store error.
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn stop_run(&self, run_id: &RunId, message: &str) -> Result<RunRecord> {
        let inner = &self.inner;
        let controller = inner.controller(run_id)?;
        let _guard = controller.lock().await;

        let mut run = inner.load_controlled(run_id).await?;
        if run.status == RunStatus::Cancelling || run.is_terminal() {
            tracing::debug!(status = %run.status, "stop ignored");
            if run.is_terminal() {
                inner.forget(run_id);
            }
            return Ok(run);
        }

        let now = inner.clock.now();
        if !inner.has_logged(run_id, EventType::Stop).await? {
            let stop = EventPayload::Stop {
                reason: RunReason::UserCancelled,
                message: message.to_string(),
            };
            inner.emit(run_id, EventScope::Run, stop, now).await?;
        }

        if run.status == RunStatus::Prepared {
            run.finish(RunStatus::Cancelled, RunReason::UserCancelled, message, now)?;
            inner.save_run(&run).await?;
            inner.record_terminal(&run);
            inner.forget(run_id);
            return Ok(run);
        }

        run.transition_to(RunStatus::Cancelling, now)?;
        run.reason = Some(RunReason::UserCancelled);
        run.reason_message = Some(message.to_string());
        inner.save_run(&run).await?;
        tracing::info!("stop requested, draining workers");
        Ok(run)
    }

    /// Reads a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a store error.
    pub async fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.inner.load_run(run_id).await
    }

    /// The most recent aggregate persisted on the run, for live display.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a store error.
    pub async fn latest_aggregate(&self, run_id: &RunId) -> Result<Option<AggregateMetrics>> {
        Ok(self.inner.load_run(run_id).await?.latest_aggregate)
    }

    /// Polls the run until it is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or a store error.
    pub async fn wait_for_terminal(&self, run_id: &RunId, poll: Duration) -> Result<RunRecord> {
        loop {
            let run = self.inner.load_run(run_id).await?;
            if run.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Restarts poll loops for runs left active by a previous process.
    ///
    /// In-memory controller state (guardrail and throughput streaks) starts
    /// over; capacity-discovery state is read back from the run record.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    #[tracing::instrument(skip(self))]
    pub async fn resume_active_runs(&self) -> Result<Vec<RunId>> {
        let store = &self.inner.store;
        let runs = self
            .inner
            .config
            .retry
            .run("list_active_runs", move || store.list_active_runs())
            .await?;

        let run_ids: Vec<RunId> = runs.iter().map(|run| run.run_id).collect();
        for run_id in &run_ids {
            self.inner.controller(run_id)?;
            if self.inner.config.autostart_poll_loop {
                self.spawn_poll_loop(*run_id)?;
            }
        }
        tracing::info!(count = run_ids.len(), "active runs resumed");
        Ok(run_ids)
    }

    /// Runs exactly one poll-loop iteration for a run.
    ///
    /// Returns the record as stored after the tick. Ticking a run that is
    /// not active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] or the store error that failed this
    /// tick.
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn tick(&self, run_id: &RunId) -> Result<RunRecord> {
        let _timer = time_tick();
        let controller = self.inner.controller(run_id)?;
        let mut state = controller.lock().await;
        let result = self.inner.tick_locked(run_id, &mut state).await;
        self.inner.metrics.record_tick(result.is_ok());
        if let Err(err) = &result {
            tracing::warn!(error = %err, "tick failed");
        }
        result
    }

    /// Number of poll loops currently running.
    #[must_use]
    pub fn active_poll_loops(&self) -> usize {
        self.inner
            .loops
            .lock()
            .map_or(0, |loops| loops.values().filter(|h| !h.is_finished()).count())
    }

    /// Number of runs holding in-memory controller state.
    #[must_use]
    pub fn controlled_runs(&self) -> usize {
        self.inner
            .controllers
            .lock()
            .map_or(0, |controllers| controllers.len())
    }

    /// Aborts every poll loop. Runs stay in the store and can be resumed.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = match self.inner.loops.lock() {
            Ok(mut loops) => loops.drain().map(|(_, handle)| handle).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, h)| h).collect(),
        };
        for handle in &handles {
            handle.abort();
        }
        self.inner.metrics.set_active_runs(0);
        tracing::info!(aborted = handles.len(), "poll loops stopped");
    }

    fn spawn_poll_loop(&self, run_id: RunId) -> Result<()> {
        let mut loops = self.inner.loops.lock().map_err(poison_err)?;
        if loops.get(&run_id).is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        let orchestrator = self.clone();
        let span = run_span("poll_loop", &run_id.to_string());
        let handle = tokio::spawn(
            async move { orchestrator.poll_loop(run_id).await }.instrument(span),
        );
        loops.insert(run_id, handle);
        let active = loops.len();
        drop(loops);
        self.inner.metrics.set_active_runs(active);
        Ok(())
    }

    async fn poll_loop(self, run_id: RunId) {
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        tracing::debug!(run_id = %run_id, "poll loop started");

        loop {
            interval.tick().await;
            match self.tick(&run_id).await {
                Ok(run) if run.is_terminal() => break,
                Err(Error::RunNotFound { .. }) => break,
                Ok(_) | Err(_) => {}
            }
        }

        let active = self.inner.loops.lock().map_or(0, |mut loops| {
            loops.remove(&run_id);
            loops.len()
        });
        self.inner.metrics.set_active_runs(active);
        tracing::debug!(run_id = %run_id, "poll loop finished");
    }
}

impl Inner {
    fn controller(&self, run_id: &RunId) -> Result<SharedController> {
        let mut controllers = self.controllers.lock().map_err(poison_err)?;
        Ok(Arc::clone(controllers.entry(*run_id).or_default()))
    }

    fn forget(&self, run_id: &RunId) {
        if let Ok(mut controllers) = self.controllers.lock() {
            controllers.remove(run_id);
        }
    }

    async fn load_run(&self, run_id: &RunId) -> Result<RunRecord> {
        let store = &self.store;
        self.config
            .retry
            .run("get_run", move || store.get_run(run_id))
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })
    }

    /// Loads a run for its controller, dropping the controller if the run
    /// does not exist.
    async fn load_controlled(&self, run_id: &RunId) -> Result<RunRecord> {
        let result = self.load_run(run_id).await;
        if matches!(result, Err(Error::RunNotFound { .. })) {
            self.forget(run_id);
        }
        result
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let store = &self.store;
        self.config
            .retry
            .run("update_run", move || store.update_run(run))
            .await
    }

    async fn heartbeats(&self, run_id: &RunId) -> Result<Vec<WorkerHeartbeat>> {
        let store = &self.store;
        self.config
            .retry
            .run("list_heartbeats", move || store.list_heartbeats(run_id))
            .await
    }

    async fn emit(
        &self,
        run_id: &RunId,
        scope: EventScope,
        payload: EventPayload,
        now: DateTime<Utc>,
    ) -> Result<ControlEvent> {
        let draft = EventDraft::new(scope, payload, now);
        let store = &self.store;
        let event = self
            .config
            .retry
            .run("append_event", move || store.append_event(run_id, draft.clone()))
            .await?;
        self.metrics.record_event(event.event_type.as_label());
        tracing::debug!(
            sequence_id = event.sequence_id,
            event_type = %event.event_type,
            scope = ?event.scope,
            "control event appended"
        );
        Ok(event)
    }

    async fn await_registration(
        &self,
        run_id: &RunId,
        expected_workers: u32,
    ) -> Vec<WorkerHeartbeat> {
        loop {
            match self.heartbeats(run_id).await {
                Ok(heartbeats) if count(heartbeats.len()) >= expected_workers => {
                    return heartbeats;
                }
                Ok(heartbeats) => {
                    tracing::debug!(registered = heartbeats.len(), expected_workers, "waiting for workers");
                }
                Err(err) => tracing::warn!(error = %err, "heartbeat read failed while registering"),
            }
            tokio::time::sleep(self.config.registration_poll_interval).await;
        }
    }

    /// Whether the run's log already holds an event of this type.
    async fn has_logged(&self, run_id: &RunId, event_type: EventType) -> Result<bool> {
        let store = &self.store;
        let logged = self
            .config
            .retry
            .run("poll_events_since", move || store.poll_events_since(run_id, 0))
            .await?;
        Ok(logged.iter().any(|event| event.event_type == event_type))
    }

    /// Appends `START` unless the log already has one, then the target of
    /// every slot.
    async fn announce_start(&self, run: &mut RunRecord, now: DateTime<Utc>) -> Result<()> {
        let run_id = run.run_id;
        let id = &run_id;
        if !self.has_logged(id, EventType::Start).await? {
            self.emit(id, EventScope::Run, EventPayload::Start { phase: run.phase }, now)
                .await?;
        }
        for (group, target) in &run.group_targets {
            self.emit(
                id,
                EventScope::WorkerGroup(*group),
                EventPayload::SetWorkerTarget {
                    target_connections: *target,
                },
                now,
            )
            .await?;
        }
        run.start_announced = true;
        Ok(())
    }

    async fn fail_before_start(
        &self,
        run_id: &RunId,
        reason: RunReason,
        message: String,
    ) -> Result<RunRecord> {
        let mut run = self.load_run(run_id).await?;
        if run.status != RunStatus::Prepared {
            return Ok(run);
        }
        if reason == RunReason::RegistrationTimeout {
            run.registered_workers = self.heartbeats(run_id).await.map_or(0, |h| count(h.len()));
        }
        run.finish(RunStatus::Failed, reason, message, self.clock.now())?;
        self.save_run(&run).await?;
        self.record_terminal(&run);
        self.forget(run_id);
        Ok(run)
    }

    fn record_terminal(&self, run: &RunRecord) {
        let reason = run.reason.unwrap_or(RunReason::Completed);
        self.metrics
            .record_terminal(&run.status.to_string(), reason.as_label());
        tracing::info!(
            run_id = %run.run_id,
            status = %run.status,
            reason = %reason,
            message = run.reason_message.as_deref().unwrap_or_default(),
            drain = ?run.drain_outcome,
            "run finished"
        );
    }

    /// Announces the end of a started run and records it. A `STOP` left
    /// by an earlier attempt whose save failed is not repeated.
    async fn conclude(
        &self,
        run: &mut RunRecord,
        status: RunStatus,
        reason: RunReason,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.has_logged(&run.run_id, EventType::Stop).await? {
            let stop = EventPayload::Stop {
                reason,
                message: message.clone(),
            };
            self.emit(&run.run_id, EventScope::Run, stop, now).await?;
        }
        run.finish(status, reason, message, now)?;
        self.final_aggregation(run, now).await?;
        self.save_run(run).await?;
        self.record_terminal(run);
        self.forget(&run.run_id);
        Ok(())
    }

    async fn final_aggregation(&self, run: &mut RunRecord, now: DateTime<Utc>) -> Result<()> {
        let run_id = run.run_id;
        let id = &run_id;
        let store = &self.store;
        let latest = self
            .config
            .retry
            .run("latest_snapshot_per_worker", move || {
                store.latest_snapshot_per_worker(id, Some(RunPhase::Measurement))
            })
            .await?;
        let aggregate = aggregate_final(&latest, now);
        apply_rollup(run, aggregate);
        Ok(())
    }

    async fn tick_locked(&self, run_id: &RunId, state: &mut RunController) -> Result<RunRecord> {
        let mut run = self.load_controlled(run_id).await?;
        if !run.status.is_active() {
            if run.is_terminal() {
                self.forget(run_id);
            }
            return Ok(run);
        }

        let now = self.clock.now();
        if run.status == RunStatus::Running && !run.start_announced {
            tracing::warn!("run was stored RUNNING without its start announcement, repeating it");
            self.announce_start(&mut run, now).await?;
            self.save_run(&run).await?;
        }

        let heartbeats = self.heartbeats(run_id).await?;
        let mut workers = classify_all(&self.config.health, heartbeats, now);
        self.sweep_dead(run_id, &mut workers, now).await?;
        run.registered_workers = run.registered_workers.max(count(workers.len()));

        if run.status == RunStatus::Cancelling {
            self.drain(&mut run, &workers, now).await?;
            return Ok(run);
        }

        if let Some(message) =
            worker_failure(run.scenario.worker_failure_policy, &workers, run.expected_workers)
        {
            tracing::warn!(%message, "worker failure policy triggered");
            self.conclude(&mut run, RunStatus::Failed, RunReason::WorkerFailure, message, now)
                .await?;
            return Ok(run);
        }

        if self.advance_schedule(&mut run, now).await? {
            return Ok(run);
        }

        let pending_key = self.refresh_aggregate(&mut run, state, &workers, now).await?;
        if run.phase == RunPhase::Measurement {
            if let Some(seeker) = ThroughputSeeker::from_scenario(&run.scenario) {
                if pending_key.is_some() {
                    self.seek_throughput(&mut run, state, &seeker, now).await?;
                }
            } else if let Some(stepper) = StepController::from_scenario(&run.scenario) {
                self.step_capacity(&mut run, &stepper, now).await?;
                if self.advance_schedule(&mut run, now).await? {
                    return Ok(run);
                }
            }
        }

        if self.apply_guardrail(&mut run, state, &workers, now).await? {
            return Ok(run);
        }

        let live: Vec<WorkerHeartbeat> = workers.into_iter().map(|w| w.heartbeat).collect();
        run.mirror_worker_targets(&live);
        run.updated_at = now;
        self.save_run(&run).await?;
        if let Some(key) = pending_key {
            state.last_aggregation = Some(key);
        }
        Ok(run)
    }

    /// Marks workers whose heartbeat aged past the dead threshold.
    ///
    /// The write is conditional on the heartbeat the sweep saw, so a worker
    /// that heartbeated in between keeps its row and is reclassified.
    async fn sweep_dead(
        &self,
        run_id: &RunId,
        workers: &mut [ClassifiedWorker],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for worker in workers.iter_mut() {
            let hb = &worker.heartbeat;
            if worker.health != WorkerHealth::Dead || hb.status == WorkerStatus::Dead {
                continue;
            }
            let store = &self.store;
            let worker_id = &hb.worker_id;
            let observed = hb.last_heartbeat;
            let result = self
                .config
                .retry
                .run("mark_worker_dead", move || {
                    store.mark_worker_dead(run_id, worker_id, observed)
                })
                .await?;
            match result {
                CasResult::Success => {
                    tracing::warn!(
                        worker_id = %worker.heartbeat.worker_id,
                        last_heartbeat = %observed,
                        "worker declared dead"
                    );
                    worker.heartbeat.status = WorkerStatus::Dead;
                }
                CasResult::Superseded {
                    actual_last_heartbeat,
                } => {
                    worker.heartbeat.last_heartbeat = actual_last_heartbeat;
                    worker.health = self.config.health.classify(&worker.heartbeat, now);
                }
                CasResult::NotFound => {}
            }
        }
        Ok(())
    }

    async fn drain(
        &self,
        run: &mut RunRecord,
        workers: &[ClassifiedWorker],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let since_cancel = run.elapsed_since_cancel(now);
        let Some(outcome) = drain_outcome(workers, since_cancel, self.config.drain_timeout) else {
            return Ok(());
        };

        run.transition_to(RunStatus::Cancelled, now)?;
        run.drain_outcome = Some(outcome);
        if outcome == DrainOutcome::Forced {
            let detail = format!(
                "drain forced after {}s",
                self.config.drain_timeout.as_secs()
            );
            run.reason_message = Some(match run.reason_message.take() {
                Some(message) if !message.is_empty() => format!("{message} ({detail})"),
                _ => detail,
            });
        }
        self.final_aggregation(run, now).await?;
        self.save_run(run).await?;
        self.record_terminal(run);
        self.forget(&run.run_id);
        Ok(())
    }

    /// Advances every phase whose boundary has passed. Returns true if the
    /// run completed.
    async fn advance_schedule(&self, run: &mut RunRecord, now: DateTime<Utc>) -> Result<bool> {
        while let Some(next) = due_phase(run, now) {
            run.advance_phase(next, now)?;
            self.emit(
                &run.run_id,
                EventScope::Run,
                EventPayload::SetPhase { phase: next },
                now,
            )
            .await?;
            tracing::info!(phase = %next, "phase advanced");

            if next == RunPhase::Measurement {
                if let Some(stepper) = StepController::from_scenario(&run.scenario) {
                    run.step_controller_state = Some(stepper.begin(now));
                }
            }
            if next == RunPhase::Processing {
                let (reason, message) = completion_reason(run);
                self.conclude(run, RunStatus::Completed, reason, message, now)
                    .await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-aggregates if the inputs changed. Returns the key to commit once
    /// the run is saved.
    async fn refresh_aggregate(
        &self,
        run: &mut RunRecord,
        state: &RunController,
        workers: &[ClassifiedWorker],
        now: DateTime<Utc>,
    ) -> Result<Option<AggregationKey>> {
        let run_id = run.run_id;
        let id = &run_id;
        let store = &self.store;
        let latest = self
            .config
            .retry
            .run("latest_snapshot_per_worker", move || {
                store.latest_snapshot_per_worker(id, Some(RunPhase::Measurement))
            })
            .await?;

        let key = AggregationKey {
            watermark: SnapshotWatermark::of(&latest),
            dead_workers: workers
                .iter()
                .filter(|w| w.health == WorkerHealth::Dead)
                .count(),
        };
        if !state.needs_aggregation(key) {
            return Ok(None);
        }

        let heartbeats: Vec<WorkerHeartbeat> =
            workers.iter().map(|w| w.heartbeat.clone()).collect();
        let aggregate = aggregate_live(&latest, &heartbeats, &self.config.health, now);
        tracing::debug!(
            workers = aggregate.worker_count(),
            excluded = aggregate.excluded_workers.len(),
            qps = aggregate.qps,
            p95 = aggregate.latency.p95,
            "live aggregate refreshed"
        );
        self.metrics.set_aggregate_qps(aggregate.qps);
        apply_rollup(run, aggregate);
        Ok(Some(key))
    }

    async fn seek_throughput(
        &self,
        run: &mut RunRecord,
        state: &mut RunController,
        seeker: &ThroughputSeeker,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(qps) = run
            .latest_aggregate
            .as_ref()
            .filter(|aggregate| aggregate.worker_count() > 0)
            .map(|aggregate| aggregate.qps)
        else {
            return Ok(());
        };

        let decision = seeker.decide(
            qps,
            &run.group_targets,
            run.expected_workers,
            &mut state.throughput_streak,
        );
        match decision {
            ThroughputDecision::Hold => {}
            ThroughputDecision::Raise { targets } => {
                tracing::info!(qps, threshold = seeker.threshold_qps(), raised = targets.len(), "raising worker targets");
                for (group, target) in targets {
                    self.set_target(run, group, target, now).await?;
                }
            }
            ThroughputDecision::AddWorker {
                worker_group_id,
                target_connections,
            } => {
                tracing::info!(qps, threshold = seeker.threshold_qps(), "fleet at ceiling, adding a worker");
                self.add_worker(run, worker_group_id, target_connections, now)
                    .await?;
            }
            ThroughputDecision::AtCapacity => {
                tracing::debug!(qps, "throughput below target with the fleet at capacity");
            }
        }
        Ok(())
    }

    async fn step_capacity(
        &self,
        run: &mut RunRecord,
        stepper: &StepController,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(step_state) = run.step_controller_state.clone() else {
            return Ok(());
        };
        if !stepper.is_due(&step_state, run.latest_aggregate.as_ref(), now) {
            return Ok(());
        }
        let Some(aggregate) = run.latest_aggregate.clone() else {
            return Ok(());
        };

        let queue_detected = match self.queue_signal.queue_detected(&run.run_id).await {
            Ok(detected) => detected,
            Err(err) => {
                tracing::warn!(error = %err, "queue signal unavailable, assuming no queueing");
                false
            }
        };

        let evaluation = stepper.evaluate(run.run_id, &step_state, &aggregate, queue_detected, now);
        self.persist_step(&evaluation.record).await?;
        self.metrics
            .record_step_evaluation(evaluation.record.outcome.as_label());
        tracing::info!(
            step = evaluation.record.step_number,
            target_connections = evaluation.record.target_connections,
            outcome = %evaluation.record.outcome,
            qps = evaluation.record.metrics.qps,
            p95 = evaluation.record.metrics.p95,
            drift_pct = ?evaluation.record.latency_drift_pct,
            "step evaluated"
        );
        run.step_controller_state = Some(evaluation.state);

        match evaluation.action {
            StepAction::Advance { target_connections } => {
                let floor = run.scenario.bounds.min_connections_per_worker;
                let next = by_group(&compute_worker_targets(
                    target_connections,
                    run.expected_workers,
                    floor,
                )?);
                for (group, target) in changed_targets(&run.group_targets, &next) {
                    self.set_target(run, group, target, now).await?;
                }
            }
            StepAction::Conclude(conclusion) => {
                tracing::info!(
                    outcome = %conclusion.outcome,
                    result = ?conclusion.result.map(|r| r.target_connections),
                    "capacity discovery concluded"
                );
            }
        }
        Ok(())
    }

    async fn persist_step(&self, record: &StepRecord) -> Result<()> {
        let store = &self.store;
        match self
            .config
            .retry
            .run("append_step_record", move || store.append_step_record(record))
            .await
        {
            Err(Error::StepAlreadyRecorded { step_number, .. }) => {
                tracing::debug!(step_number, "step record already persisted");
                Ok(())
            }
            other => other,
        }
    }

    async fn apply_guardrail(
        &self,
        run: &mut RunRecord,
        state: &mut RunController,
        workers: &[ClassifiedWorker],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(config) = run.scenario.guardrails else {
            return Ok(false);
        };
        let loads = worker_loads(workers, &run.group_targets);
        let outcome = guardrail::evaluate(
            &config,
            &loads,
            &run.scenario.bounds,
            run.expected_workers,
            state.fleet_breach_streak,
        );
        state.fleet_breach_streak = outcome.fleet_breach_streak;
        if !matches!(outcome.decision, GuardrailDecision::None) {
            self.metrics
                .record_guardrail_action(outcome.decision.as_label());
        }

        match outcome.decision {
            GuardrailDecision::None => {}
            GuardrailDecision::BackOff {
                scale_downs,
                compensation,
            } => {
                for scale_down in scale_downs {
                    tracing::warn!(
                        worker_id = %scale_down.worker_id,
                        from = scale_down.from,
                        to = scale_down.to,
                        reason = %scale_down.reason,
                        "guardrail backing off worker"
                    );
                    run.set_group_target(scale_down.worker_group_id, scale_down.to);
                    self.emit(
                        &run.run_id,
                        EventScope::Worker(scale_down.worker_id),
                        EventPayload::ScaleDown {
                            target_connections: scale_down.to,
                            reason: scale_down.reason,
                        },
                        now,
                    )
                    .await?;
                }
                let absorbed = match compensation {
                    Compensation::ScaleOut {
                        worker_group_id,
                        target_connections,
                    } => {
                        self.add_worker(run, worker_group_id, target_connections, now)
                            .await?
                    }
                    Compensation::Degraded => false,
                };
                if !absorbed && !run.degraded {
                    tracing::warn!("shed load cannot be re-absorbed, continuing degraded");
                    run.degraded = true;
                }
            }
            GuardrailDecision::AtFloor {
                breached_workers,
                reason,
            } => {
                tracing::warn!(breached_workers, %reason, "offending workers already at the floor, continuing degraded");
                run.degraded = true;
            }
            GuardrailDecision::Warn {
                breached_workers,
                consecutive_ticks,
                patience,
            } => {
                tracing::warn!(breached_workers, consecutive_ticks, patience, "whole fleet over guardrail threshold");
                self.emit(
                    &run.run_id,
                    EventScope::Run,
                    EventPayload::GuardrailWarning {
                        breached_workers,
                        consecutive_ticks,
                        patience,
                    },
                    now,
                )
                .await?;
            }
            GuardrailDecision::Fail { message } => {
                self.conclude(run, RunStatus::Failed, RunReason::ResourceExhaustion, message, now)
                    .await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn set_target(
        &self,
        run: &mut RunRecord,
        group: WorkerGroupId,
        target: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        run.set_group_target(group, target);
        self.emit(
            &run.run_id,
            EventScope::WorkerGroup(group),
            EventPayload::SetWorkerTarget {
                target_connections: target,
            },
            now,
        )
        .await?;
        Ok(())
    }

    /// Launches one more worker. Returns false if the spawner refused.
    async fn add_worker(
        &self,
        run: &mut RunRecord,
        group: WorkerGroupId,
        target: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let request = SpawnRequest {
            run_id: run.run_id,
            worker_group_id: group,
            worker_group_count: run.expected_workers.saturating_add(1),
        };
        if let Err(err) = self.spawner.spawn(request).await {
            tracing::warn!(worker_group_id = %group, error = %err, "scale-out spawn failed");
            return Ok(false);
        }
        run.expected_workers = request.worker_group_count;
        self.set_target(run, group, target, now).await?;
        tracing::info!(
            worker_group_id = %group,
            target_connections = target,
            expected_workers = run.expected_workers,
            "worker added"
        );
        Ok(true)
    }
}

fn apply_rollup(run: &mut RunRecord, aggregate: AggregateMetrics) {
    run.total_ops = aggregate.total_ops;
    run.error_count = aggregate.error_count;
    run.current_qps = aggregate.qps;
    run.latest_aggregate = Some(aggregate);
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
