//! In-memory state store.
//!
//! [`InMemoryStateStore`] keeps every record of every run behind one
//! `RwLock`, so each trait call is atomic with respect to every other.
//!
//! ## Limitations
//!
//! - **No durability**: all state is lost when the process exits
//! - **Single-process only**: workers must share the same instance

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use surge_core::{RunId, WorkerId};

use super::{CasResult, StateStore};
use crate::error::{Error, Result};
use crate::events::{ControlEvent, EventDraft};
use crate::heartbeat::{WorkerHeartbeat, WorkerStatus};
use crate::run::{RunPhase, RunRecord};
use crate::scaling::step::StepRecord;
use crate::snapshot::WorkerSnapshot;

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    events: Vec<ControlEvent>,
    heartbeats: BTreeMap<WorkerId, WorkerHeartbeat>,
    snapshots: Vec<WorkerSnapshot>,
    steps: BTreeMap<u32, StepRecord>,
}

impl RunEntry {
    fn new(record: RunRecord) -> Self {
        Self {
            record,
            events: Vec::new(),
            heartbeats: BTreeMap::new(),
            snapshots: Vec::new(),
            steps: BTreeMap::new(),
        }
    }
}

/// In-memory store for tests and single-process deployments.
///
/// ## Example
///
/// ```rust
/// use surge_control::store::memory::InMemoryStateStore;
///
/// let store = InMemoryStateStore::new();
/// assert_eq!(store.run_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let count = {
            let runs = self.runs.read().map_err(poison_err)?;
            runs.len()
        };
        Ok(count)
    }

    /// Returns the number of events appended to a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn event_count(&self, run_id: &RunId) -> Result<usize> {
        let count = {
            let runs = self.runs.read().map_err(poison_err)?;
            runs.get(run_id).map_or(0, |entry| entry.events.len())
        };
        Ok(count)
    }

    fn with_entry<T>(&self, run_id: &RunId, f: impl FnOnce(&RunEntry) -> T) -> Result<T> {
        let runs = self.runs.read().map_err(poison_err)?;
        let entry = runs
            .get(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        Ok(f(entry))
    }

    fn with_entry_mut<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunEntry) -> Result<T>,
    ) -> Result<T> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let entry = runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        f(entry)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if runs.contains_key(&run.run_id) {
            return Err(Error::RunAlreadyExists { run_id: run.run_id });
        }
        runs.insert(run.run_id, RunEntry::new(run.clone()));
        drop(runs);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let result = {
            let runs = self.runs.read().map_err(poison_err)?;
            runs.get(run_id).map(|entry| entry.record.clone())
        };
        Ok(result)
    }

    async fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.with_entry_mut(&run.run_id, |entry| {
            let next_sequence_id = entry.record.next_sequence_id;
            let created_at = entry.record.created_at;
            entry.record = run.clone();
            entry.record.next_sequence_id = next_sequence_id;
            entry.record.created_at = created_at;
            Ok(())
        })
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        let mut active: Vec<RunRecord> = {
            let runs = self.runs.read().map_err(poison_err)?;
            runs.values()
                .filter(|entry| entry.record.status.is_active())
                .map(|entry| entry.record.clone())
                .collect()
        };
        active.sort_by_key(|run| run.run_id);
        Ok(active)
    }

    async fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<ControlEvent> {
        self.with_entry_mut(run_id, |entry| {
            let sequence_id = entry.record.next_sequence_id;
            entry.record.next_sequence_id = sequence_id + 1;
            let event = ControlEvent::from_draft(*run_id, sequence_id, draft);
            entry.events.push(event.clone());
            Ok(event)
        })
    }

    async fn poll_events_since(
        &self,
        run_id: &RunId,
        last_seen: u64,
    ) -> Result<Vec<ControlEvent>> {
        self.with_entry(run_id, |entry| {
            entry
                .events
                .iter()
                .filter(|event| event.sequence_id > last_seen)
                .cloned()
                .collect()
        })
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        self.with_entry_mut(&heartbeat.run_id, |entry| {
            entry
                .heartbeats
                .insert(heartbeat.worker_id.clone(), heartbeat.clone());
            Ok(())
        })
    }

    async fn list_heartbeats(&self, run_id: &RunId) -> Result<Vec<WorkerHeartbeat>> {
        let mut heartbeats: Vec<WorkerHeartbeat> =
            self.with_entry(run_id, |entry| entry.heartbeats.values().cloned().collect())?;
        heartbeats.sort_by(|a, b| {
            a.worker_group_id
                .cmp(&b.worker_group_id)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        Ok(heartbeats)
    }

    async fn mark_worker_dead(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        observed_last_heartbeat: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let Some(heartbeat) = runs
            .get_mut(run_id)
            .and_then(|entry| entry.heartbeats.get_mut(worker_id))
        else {
            drop(runs);
            return Ok(CasResult::NotFound);
        };

        if heartbeat.last_heartbeat != observed_last_heartbeat {
            let actual_last_heartbeat = heartbeat.last_heartbeat;
            drop(runs);
            return Ok(CasResult::Superseded {
                actual_last_heartbeat,
            });
        }

        heartbeat.status = WorkerStatus::Dead;
        drop(runs);
        Ok(CasResult::Success)
    }

    async fn append_snapshot(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        self.with_entry_mut(&snapshot.run_id, |entry| {
            entry.snapshots.push(snapshot.clone());
            Ok(())
        })
    }

    async fn latest_snapshot_per_worker(
        &self,
        run_id: &RunId,
        phase: Option<RunPhase>,
    ) -> Result<Vec<WorkerSnapshot>> {
        self.with_entry(run_id, |entry| {
            let mut latest: BTreeMap<&WorkerId, &WorkerSnapshot> = BTreeMap::new();
            for snapshot in &entry.snapshots {
                if phase.is_some_and(|p| p != snapshot.phase) {
                    continue;
                }
                latest
                    .entry(&snapshot.worker_id)
                    .and_modify(|current| {
                        if snapshot.timestamp >= current.timestamp {
                            *current = snapshot;
                        }
                    })
                    .or_insert(snapshot);
            }
            latest.into_values().cloned().collect()
        })
    }

    async fn list_snapshots(&self, run_id: &RunId) -> Result<Vec<WorkerSnapshot>> {
        let mut snapshots = self.with_entry(run_id, |entry| entry.snapshots.clone())?;
        snapshots.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        Ok(snapshots)
    }

    async fn append_step_record(&self, record: &StepRecord) -> Result<()> {
        self.with_entry_mut(&record.run_id, |entry| {
            if entry.steps.contains_key(&record.step_number) {
                return Err(Error::StepAlreadyRecorded {
                    run_id: record.run_id,
                    step_number: record.step_number,
                });
            }
            entry.steps.insert(record.step_number, record.clone());
            Ok(())
        })
    }

    async fn list_step_records(&self, run_id: &RunId) -> Result<Vec<StepRecord>> {
        self.with_entry(run_id, |entry| entry.steps.values().cloned().collect())
    }
}
