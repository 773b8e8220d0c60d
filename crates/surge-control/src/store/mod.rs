//! Pluggable persistence for control-plane state.
//!
//! The [`StateStore`] trait is the only medium between the orchestrator and
//! its workers. It holds no business logic and never retries; callers wrap
//! calls in a [`RetryPolicy`](crate::retry::RetryPolicy).
//!
//! ## Record kinds
//!
//! | Record | Key | Mutability |
//! |--------|-----|------------|
//! | `RunRecord` | `run_id` | full replace by the orchestrator |
//! | `ControlEvent` | `(run_id, sequence_id)` | append-only |
//! | `WorkerHeartbeat` | `(run_id, worker_id)` | upserted by its worker |
//! | `WorkerSnapshot` | `(run_id, worker_id, timestamp)` | append-only |
//! | `StepRecord` | `(run_id, step_number)` | append-only |
//!
//! ## Sequence numbers
//!
//! [`StateStore::append_event`] reads `next_sequence_id`, inserts the event
//! under that number and increments the counter as one atomic step. No two
//! events of a run ever share a number, whatever the number of concurrent
//! writers. [`StateStore::update_run`] never touches the counter.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use surge_core::{RunId, WorkerId};

use crate::error::Result;
use crate::events::{ControlEvent, EventDraft};
use crate::heartbeat::WorkerHeartbeat;
use crate::run::{RunPhase, RunRecord};
use crate::scaling::step::StepRecord;
use crate::snapshot::WorkerSnapshot;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Entity not found.
    NotFound,
    /// The row changed after the caller observed it.
    Superseded {
        /// The heartbeat time actually stored.
        actual_last_heartbeat: DateTime<Utc>,
    },
}

/// Storage abstraction for control-plane state.
///
/// Any operation may fail with a transient error; implementations surface
/// it as [`Error::TransientStore`](crate::error::Error::TransientStore) and
/// leave retrying to the caller.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    // --- Runs ---

    /// Inserts a new run record.
    ///
    /// # Errors
    ///
    /// Returns `RunAlreadyExists` if the run id is taken.
    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    /// Gets a run by id; `None` if it does not exist.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    /// Replaces the mutable fields of a run.
    ///
    /// `next_sequence_id` and `created_at` keep their stored values.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    async fn update_run(&self, run: &RunRecord) -> Result<()>;

    /// Lists runs in `RUNNING` or `CANCELLING`.
    async fn list_active_runs(&self) -> Result<Vec<RunRecord>>;

    // --- Control events ---

    /// Appends an event under the next sequence number of its run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    async fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<ControlEvent>;

    /// Events with `sequence_id > last_seen`, ascending.
    async fn poll_events_since(&self, run_id: &RunId, last_seen: u64)
    -> Result<Vec<ControlEvent>>;

    // --- Heartbeats ---

    /// Inserts or replaces a worker's heartbeat row.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()>;

    /// All heartbeat rows of a run, ordered by slot then worker id.
    async fn list_heartbeats(&self, run_id: &RunId) -> Result<Vec<WorkerHeartbeat>>;

    /// Marks a worker `DEAD` only if its heartbeat is still the one the
    /// caller observed.
    async fn mark_worker_dead(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        observed_last_heartbeat: DateTime<Utc>,
    ) -> Result<CasResult>;

    // --- Snapshots ---

    /// Appends a metric snapshot.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    async fn append_snapshot(&self, snapshot: &WorkerSnapshot) -> Result<()>;

    /// The newest snapshot of each worker among those matching `phase`,
    /// ordered by worker id.
    async fn latest_snapshot_per_worker(
        &self,
        run_id: &RunId,
        phase: Option<RunPhase>,
    ) -> Result<Vec<WorkerSnapshot>>;

    /// Every snapshot of a run, ordered by timestamp then worker id.
    async fn list_snapshots(&self, run_id: &RunId) -> Result<Vec<WorkerSnapshot>>;

    // --- Step records ---

    /// Appends an immutable step record.
    ///
    /// # Errors
    ///
    /// Returns `StepAlreadyRecorded` if the step number is taken and
    /// `RunNotFound` if the run does not exist.
    async fn append_step_record(&self, record: &StepRecord) -> Result<()>;

    /// Step records of a run, ascending by step number.
    async fn list_step_records(&self, run_id: &RunId) -> Result<Vec<StepRecord>>;
}
