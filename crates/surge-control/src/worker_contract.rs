//! Data-plane side of the control protocol.
//!
//! Workers never talk to the orchestrator. They poll control events from
//! the store, apply the ones in scope strictly in ascending sequence
//! order, and exit under the conditions in [`ExitPolicy`].

use std::time::Duration;

use chrono::{DateTime, Utc};

use surge_core::{WorkerGroupId, WorkerId};

use crate::events::{ControlEvent, EventPayload};
use crate::run::{RunRecord, RunStatus};

/// Per-worker consumption cursor over a run's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    worker_id: WorkerId,
    worker_group_id: WorkerGroupId,
    last_seen: u64,
}

impl EventCursor {
    /// A cursor that has seen nothing.
    #[must_use]
    pub const fn new(worker_id: WorkerId, worker_group_id: WorkerGroupId) -> Self {
        Self {
            worker_id,
            worker_group_id,
            last_seen: 0,
        }
    }

    /// Highest sequence id consumed so far; pass to `poll_events_since`.
    #[must_use]
    pub const fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Consumes a polled batch.
    ///
    /// Events at or below `last_seen` are dropped as duplicates. The cursor
    /// advances past every new event, including ones addressed to other
    /// workers, and only the in-scope events are returned, ascending.
    pub fn accept(&mut self, mut events: Vec<ControlEvent>) -> Vec<ControlEvent> {
        events.sort_by_key(|e| e.sequence_id);
        let mut applied = Vec::new();
        for event in events {
            if event.sequence_id <= self.last_seen {
                continue;
            }
            self.last_seen = event.sequence_id;
            if event.scope.matches(&self.worker_id, self.worker_group_id) {
                applied.push(event);
            }
        }
        applied
    }
}

/// Fallback target for a worker that suspects it missed events.
///
/// Prefers the per-worker mirror, then the slot table.
#[must_use]
pub fn fallback_target(
    run: &RunRecord,
    worker_id: &WorkerId,
    worker_group_id: WorkerGroupId,
) -> Option<u32> {
    run.worker_targets
        .get(worker_id)
        .or_else(|| run.group_targets.get(&worker_group_id))
        .copied()
}

/// Why a worker must exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// A `STOP` event was applied; exit after draining.
    StopReceived,
    /// The run never reached `RUNNING` within the registration timeout.
    RegistrationTimedOut,
    /// The store was unreachable for longer than the no-connection timeout.
    StoreUnreachable,
    /// The run record is terminal.
    RunTerminal,
}

/// What a worker knows about its situation at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerObservation {
    /// Whether a `STOP` event has been applied.
    pub stop_received: bool,
    /// When the worker registered.
    pub registered_at: DateTime<Utc>,
    /// Last status read from the run record, if any read succeeded.
    pub run_status: Option<RunStatus>,
    /// Last successful store round trip.
    pub last_store_contact: DateTime<Utc>,
}

/// Worker self-termination rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicy {
    /// How long to wait for the run to reach `RUNNING`.
    pub registration_timeout: Duration,
    /// How long the store may be unreachable.
    pub no_connection_timeout: Duration,
}

impl ExitPolicy {
    /// Checks the exit conditions in priority order.
    #[must_use]
    pub fn check(&self, observation: &WorkerObservation, now: DateTime<Utc>) -> Option<ExitCondition> {
        if observation.stop_received {
            return Some(ExitCondition::StopReceived);
        }
        if observation.run_status.is_some_and(|s| s.is_terminal()) {
            return Some(ExitCondition::RunTerminal);
        }
        if elapsed(observation.last_store_contact, now) >= self.no_connection_timeout {
            return Some(ExitCondition::StoreUnreachable);
        }
        let started = observation
            .run_status
            .is_some_and(|s| s != RunStatus::Prepared);
        if !started && elapsed(observation.registered_at, now) >= self.registration_timeout {
            return Some(ExitCondition::RegistrationTimedOut);
        }
        None
    }
}

/// Returns true if applying `payload` obliges the worker to drain and exit.
#[must_use]
pub const fn is_stop(payload: &EventPayload) -> bool {
    matches!(payload, EventPayload::Stop { .. })
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}
