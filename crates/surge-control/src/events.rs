//! Control events: the ordered, append-only command channel to workers.
//!
//! The orchestrator is the only writer. Each event receives a per-run
//! `sequence_id` from the store's atomic counter; that number is the sole
//! ordering authority consumers use. Events are never mutated after they
//! are written.
//!
//! Targets are always absolute. A worker that misses several
//! `SET_WORKER_TARGET` events converges correctly on the next one it sees.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::{EventId, RunId, WorkerGroupId, WorkerId};

use crate::run::{RunPhase, RunReason};

/// Kind of control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Begin applying load.
    Start,
    /// Stop admitting work, drain, exit.
    Stop,
    /// Converge on a new run phase.
    SetPhase,
    /// Converge on an absolute connection target.
    SetWorkerTarget,
    /// Guardrail back-off to an absolute connection target.
    ScaleDown,
    /// Fleet-wide resource pressure, informational.
    GuardrailWarning,
}

impl EventType {
    /// Returns the snake-case label used for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::SetPhase => "set_phase",
            Self::SetWorkerTarget => "set_worker_target",
            Self::ScaleDown => "scale_down",
            Self::GuardrailWarning => "guardrail_warning",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Which workers an event addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventScope {
    /// Every worker of the run.
    Run,
    /// The worker occupying one slot.
    WorkerGroup(WorkerGroupId),
    /// One worker by identity.
    Worker(WorkerId),
}

impl EventScope {
    /// Returns true if a worker with this identity and slot must apply the event.
    #[must_use]
    pub fn matches(&self, worker_id: &WorkerId, group: WorkerGroupId) -> bool {
        match self {
            Self::Run => true,
            Self::WorkerGroup(target) => *target == group,
            Self::Worker(target) => target == worker_id,
        }
    }
}

/// Typed body of a control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// Begin applying load in the given phase.
    Start {
        /// Phase the run entered when it started.
        phase: RunPhase,
    },
    /// Stop admitting work and drain.
    Stop {
        /// Why the run is stopping.
        reason: RunReason,
        /// Human-readable detail.
        message: String,
    },
    /// Converge on a new phase.
    SetPhase {
        /// The phase to adopt.
        phase: RunPhase,
    },
    /// Converge on an absolute connection target.
    SetWorkerTarget {
        /// Absolute number of connections.
        target_connections: u32,
    },
    /// Reduce connections because of resource pressure.
    ScaleDown {
        /// Absolute number of connections after the back-off.
        target_connections: u32,
        /// Why the worker is being backed off.
        reason: String,
    },
    /// Fleet-wide resource pressure below the failure patience.
    GuardrailWarning {
        /// Workers currently over threshold.
        breached_workers: u32,
        /// Consecutive ticks the whole fleet has been over threshold.
        consecutive_ticks: u32,
        /// Ticks after which the run fails.
        patience: u32,
    },
}

impl EventPayload {
    /// The event type this payload is written as.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Start { .. } => EventType::Start,
            Self::Stop { .. } => EventType::Stop,
            Self::SetPhase { .. } => EventType::SetPhase,
            Self::SetWorkerTarget { .. } => EventType::SetWorkerTarget,
            Self::ScaleDown { .. } => EventType::ScaleDown,
            Self::GuardrailWarning { .. } => EventType::GuardrailWarning,
        }
    }

    /// The absolute connection target carried by the payload, if any.
    #[must_use]
    pub const fn target_connections(&self) -> Option<u32> {
        match self {
            Self::SetWorkerTarget { target_connections }
            | Self::ScaleDown {
                target_connections, ..
            } => Some(*target_connections),
            _ => None,
        }
    }
}

/// An event the orchestrator wants appended.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    /// Addressed workers.
    pub scope: EventScope,
    /// Body.
    pub payload: EventPayload,
    /// Creation time as seen by the orchestrator's clock.
    pub created_at: DateTime<Utc>,
}

impl EventDraft {
    /// Creates a draft.
    #[must_use]
    pub const fn new(scope: EventScope, payload: EventPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            payload,
            created_at,
        }
    }
}

/// A stored, immutable control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEvent {
    /// Unique event identity.
    pub event_id: EventId,
    /// Owning run.
    pub run_id: RunId,
    /// Kind of event; always equal to `payload.event_type()`.
    pub event_type: EventType,
    /// Addressed workers.
    pub scope: EventScope,
    /// Body.
    pub payload: EventPayload,
    /// Per-run, strictly increasing sequence number starting at 1.
    pub sequence_id: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ControlEvent {
    /// Materialises a draft with the sequence number the store assigned.
    #[must_use]
    pub fn from_draft(run_id: RunId, sequence_id: u64, draft: EventDraft) -> Self {
        Self {
            event_id: EventId::generate(),
            run_id,
            event_type: draft.payload.event_type(),
            scope: draft.scope,
            payload: draft.payload,
            sequence_id,
            created_at: draft.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching() {
        let me = WorkerId::new("w-1");
        let group = WorkerGroupId::new(1);
        assert!(EventScope::Run.matches(&me, group));
        assert!(EventScope::WorkerGroup(WorkerGroupId::new(1)).matches(&me, group));
        assert!(!EventScope::WorkerGroup(WorkerGroupId::new(2)).matches(&me, group));
        assert!(EventScope::Worker(WorkerId::new("w-1")).matches(&me, group));
        assert!(!EventScope::Worker(WorkerId::new("w-2")).matches(&me, group));
    }

    #[test]
    fn event_type_follows_payload() {
        let draft = EventDraft::new(
            EventScope::Run,
            EventPayload::SetPhase {
                phase: RunPhase::Measurement,
            },
            Utc::now(),
        );
        let event = ControlEvent::from_draft(RunId::generate(), 7, draft);
        assert_eq!(event.event_type, EventType::SetPhase);
        assert_eq!(event.sequence_id, 7);
    }

    #[test]
    fn scope_wire_shape() {
        let json = serde_json::to_value(EventScope::WorkerGroup(WorkerGroupId::new(3))).unwrap();
        assert_eq!(json["scope"], "WORKER_GROUP");
        assert_eq!(json["target"], 3);
        let json = serde_json::to_value(EventScope::Run).unwrap();
        assert_eq!(json["scope"], "RUN");
    }

    #[test]
    fn payload_wire_shape() {
        let json = serde_json::to_value(EventPayload::ScaleDown {
            target_connections: 8,
            reason: "cpu 97%".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "SCALE_DOWN");
        assert_eq!(json["target_connections"], 8);
    }

    #[test]
    fn only_target_payloads_carry_targets() {
        assert_eq!(
            EventPayload::SetWorkerTarget {
                target_connections: 4
            }
            .target_connections(),
            Some(4)
        );
        assert_eq!(
            EventPayload::SetPhase {
                phase: RunPhase::Warmup
            }
            .target_connections(),
            None
        );
    }
}
