//! Run lifecycle record and its two state machines.
//!
//! A run carries two independent, monotonic state machines:
//!
//! ```text
//! Status:  PREPARED ──► RUNNING ──► CANCELLING ──► CANCELLED
//!              │           │
//!              │           ├──► COMPLETED
//!              │           └──► FAILED
//!              ├──► FAILED      (registration timeout / spawn failure)
//!              └──► CANCELLED   (stopped before it started)
//!
//! Phase:   PREPARING ─► WARMUP ─► MEASUREMENT ─► COOLDOWN ─► PROCESSING
//! ```
//!
//! Neither ever regresses. The record is mutated only by the orchestrator;
//! `next_sequence_id` is owned by the store and is only advanced through
//! [`StateStore::append_event`](crate::store::StateStore::append_event).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::{RunId, WorkerGroupId, WorkerId};

use crate::aggregation::AggregateMetrics;
use crate::config::ScenarioConfig;
use crate::error::{Error, Result};
use crate::heartbeat::WorkerHeartbeat;
use crate::scaling::step::StepControllerState;

/// Run status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created and validated, no workers launched yet.
    Prepared,
    /// Workers registered and the poll loop is active.
    Running,
    /// A stop was requested; workers are draining.
    Cancelling,
    /// Ran to the end of its configured schedule.
    Completed,
    /// Ended by a failure condition.
    Failed,
    /// Ended by a stop request.
    Cancelled,
}

impl RunStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Prepared,
        Self::Running,
        Self::Cancelling,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the poll loop should be ticking for this status.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Prepared => matches!(target, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => matches!(target, Self::Cancelling | Self::Completed | Self::Failed),
            Self::Cancelling => matches!(target, Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepared => "PREPARED",
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Run-wide phase that all workers converge on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    /// Workers are being launched and registered.
    Preparing,
    /// Load is applied but not measured.
    Warmup,
    /// Load is applied and measured.
    Measurement,
    /// Load is winding down.
    Cooldown,
    /// Final aggregation; no load.
    Processing,
}

impl RunPhase {
    /// All phases, in progression order.
    pub const ALL: [Self; 5] = [
        Self::Preparing,
        Self::Warmup,
        Self::Measurement,
        Self::Cooldown,
        Self::Processing,
    ];

    /// Returns true if the phase may advance from self to target.
    #[must_use]
    pub fn can_advance_to(&self, target: Self) -> bool {
        target > *self
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "PREPARING",
            Self::Warmup => "WARMUP",
            Self::Measurement => "MEASUREMENT",
            Self::Cooldown => "COOLDOWN",
            Self::Processing => "PROCESSING",
        };
        f.write_str(s)
    }
}

/// Machine-readable reason attached to a run when it leaves `RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunReason {
    /// The configured schedule ran to its end.
    Completed,
    /// A caller requested the stop.
    UserCancelled,
    /// One or more workers died under the configured failure policy.
    WorkerFailure,
    /// Sustained fleet-wide guardrail breach (or any breach in hard mode).
    ResourceExhaustion,
    /// Not every expected worker registered in time.
    RegistrationTimeout,
    /// The spawner could not launch the fleet.
    SpawnFailed,
    /// Capacity discovery hit the configured upper bound while still stable.
    BoundsLimitReached,
    /// Capacity discovery found the maximum stable step.
    CapacityFound,
}

impl RunReason {
    /// Returns the snake-case label used for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::UserCancelled => "user_cancelled",
            Self::WorkerFailure => "worker_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::RegistrationTimeout => "registration_timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::BoundsLimitReached => "bounds_limit_reached",
            Self::CapacityFound => "capacity_found",
        }
    }
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// How a two-phase stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrainOutcome {
    /// Every worker reached `COMPLETED` or went away before the drain timeout.
    Graceful,
    /// The drain timeout elapsed and the run was cancelled regardless.
    Forced,
}

/// The single authoritative record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Immutable run identity.
    pub run_id: RunId,
    /// Scenario this run executes.
    pub scenario: ScenarioConfig,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Run-wide phase.
    pub phase: RunPhase,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the run entered `RUNNING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the run left `WARMUP`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_end_time: Option<DateTime<Utc>>,
    /// When the run left `MEASUREMENT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_end_time: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// When a stop was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Number of workers the orchestrator has asked the spawner for.
    pub expected_workers: u32,
    /// Number of distinct workers that have heartbeated.
    pub registered_workers: u32,
    /// Rollup: operations across included workers.
    pub total_ops: u64,
    /// Rollup: errors across included workers.
    pub error_count: u64,
    /// Rollup: current aggregate throughput.
    pub current_qps: f64,
    /// Latest aggregate payload for live display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_aggregate: Option<AggregateMetrics>,
    /// Authoritative per-slot connection targets chosen by the controllers.
    #[serde(default)]
    pub group_targets: BTreeMap<WorkerGroupId, u32>,
    /// Best-effort mirror of the last target sent to each registered worker.
    #[serde(default)]
    pub worker_targets: BTreeMap<WorkerId, u32>,
    /// Next control-event sequence number. Owned by the store.
    pub next_sequence_id: u64,
    /// Capacity-discovery state, present only in find-max mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_controller_state: Option<StepControllerState>,
    /// Whether `START` and the initial targets reached the event log.
    #[serde(default)]
    pub start_announced: bool,
    /// Guardrail shed load that could not be re-absorbed by scale-out.
    #[serde(default)]
    pub degraded: bool,
    /// Why the run left `RUNNING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RunReason>,
    /// Human-readable detail for `reason`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_message: Option<String>,
    /// How the two-phase stop ended, for cancelled runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_outcome: Option<DrainOutcome>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Creates a freshly prepared run.
    #[must_use]
    pub fn new(run_id: RunId, scenario: ScenarioConfig, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            scenario,
            status: RunStatus::Prepared,
            phase: RunPhase::Preparing,
            created_at: now,
            start_time: None,
            warmup_end_time: None,
            measurement_end_time: None,
            end_time: None,
            cancel_requested_at: None,
            expected_workers: 0,
            registered_workers: 0,
            total_ops: 0,
            error_count: 0,
            current_qps: 0.0,
            latest_aggregate: None,
            group_targets: BTreeMap::new(),
            worker_targets: BTreeMap::new(),
            next_sequence_id: 1,
            step_controller_state: None,
            start_announced: false,
            degraded: false,
            reason: None,
            reason_message: None,
            drain_outcome: None,
            updated_at: now,
        }
    }

    /// Returns true if the run is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions the status, stamping `start_time`/`end_time`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the edge is not in the
    /// status graph.
    #[tracing::instrument(skip(self), fields(run_id = %self.run_id, from = %self.status, to = %target))]
    pub fn transition_to(&mut self, target: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "invalid run status transition".into(),
            });
        }

        match target {
            RunStatus::Running => self.start_time = Some(now),
            RunStatus::Cancelling => self.cancel_requested_at = Some(now),
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                self.end_time = Some(now);
            }
            RunStatus::Prepared => {}
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Moves the status to a terminal value and records why.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not reachable from the current status.
    pub fn finish(
        &mut self,
        target: RunStatus,
        reason: RunReason,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition_to(target, now)?;
        self.reason = Some(reason);
        self.reason_message = Some(message.into());
        Ok(())
    }

    /// Advances the phase, stamping the phase boundary timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `target` is not after the
    /// current phase.
    pub fn advance_phase(&mut self, target: RunPhase, now: DateTime<Utc>) -> Result<()> {
        if !self.phase.can_advance_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
                reason: "phase never regresses".into(),
            });
        }

        if self.phase <= RunPhase::Warmup && target >= RunPhase::Measurement {
            self.warmup_end_time = Some(now);
        }
        if self.phase <= RunPhase::Measurement && target >= RunPhase::Cooldown {
            self.measurement_end_time = Some(now);
        }

        self.phase = target;
        self.updated_at = now;
        Ok(())
    }

    /// Time spent since the run started, or zero before it started.
    #[must_use]
    pub fn elapsed_since_start(&self, now: DateTime<Utc>) -> Duration {
        self.start_time
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default()
    }

    /// Time spent since measurement ended, or zero if it has not.
    #[must_use]
    pub fn elapsed_since_measurement_end(&self, now: DateTime<Utc>) -> Duration {
        self.measurement_end_time
            .and_then(|end| (now - end).to_std().ok())
            .unwrap_or_default()
    }

    /// Time spent since the stop request, or zero if none was made.
    #[must_use]
    pub fn elapsed_since_cancel(&self, now: DateTime<Utc>) -> Duration {
        self.cancel_requested_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or_default()
    }

    /// Records a new authoritative target for a worker slot.
    pub fn set_group_target(&mut self, group: WorkerGroupId, target: u32) {
        self.group_targets.insert(group, target);
    }

    /// Rebuilds the worker-id keyed mirror from the slot table.
    ///
    /// Only registered workers appear in the mirror; a slot whose worker has
    /// not yet heartbeated is picked up on a later call.
    pub fn mirror_worker_targets(&mut self, heartbeats: &[WorkerHeartbeat]) {
        for hb in heartbeats {
            if let Some(target) = self.group_targets.get(&hb.worker_group_id) {
                self.worker_targets.insert(hb.worker_id.clone(), *target);
            }
        }
    }

    /// Sum of all slot targets.
    #[must_use]
    pub fn total_target_connections(&self) -> u64 {
        self.group_targets.values().map(|t| u64::from(*t)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;

    fn record() -> RunRecord {
        RunRecord::new(RunId::generate(), ScenarioConfig::fixed_total(10, 5), Utc::now())
    }

    #[test]
    fn new_record_starts_prepared() {
        let run = record();
        assert_eq!(run.status, RunStatus::Prepared);
        assert_eq!(run.phase, RunPhase::Preparing);
        assert_eq!(run.next_sequence_id, 1);
        assert!(run.start_time.is_none());
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn cancelling_only_reaches_cancelled() {
        for to in RunStatus::ALL {
            assert_eq!(
                RunStatus::Cancelling.can_transition_to(to),
                to == RunStatus::Cancelled
            );
        }
    }

    #[test]
    fn transition_stamps_times() -> Result<()> {
        let mut run = record();
        let now = Utc::now();
        run.transition_to(RunStatus::Running, now)?;
        assert_eq!(run.start_time, Some(now));
        run.transition_to(RunStatus::Cancelling, now)?;
        assert_eq!(run.cancel_requested_at, Some(now));
        run.transition_to(RunStatus::Cancelled, now)?;
        assert_eq!(run.end_time, Some(now));
        Ok(())
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_kept() {
        let mut run = record();
        let result = run.transition_to(RunStatus::Completed, Utc::now());
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
        assert_eq!(run.status, RunStatus::Prepared);
    }

    #[test]
    fn phase_never_regresses() -> Result<()> {
        let mut run = record();
        let now = Utc::now();
        run.advance_phase(RunPhase::Warmup, now)?;
        run.advance_phase(RunPhase::Measurement, now)?;
        assert_eq!(run.warmup_end_time, Some(now));
        assert!(run.advance_phase(RunPhase::Warmup, now).is_err());
        assert!(run.advance_phase(RunPhase::Measurement, now).is_err());
        assert_eq!(run.phase, RunPhase::Measurement);
        Ok(())
    }

    #[test]
    fn skipping_phases_stamps_intermediate_boundaries() -> Result<()> {
        let mut run = record();
        let now = Utc::now();
        run.advance_phase(RunPhase::Warmup, now)?;
        run.advance_phase(RunPhase::Processing, now)?;
        assert_eq!(run.warmup_end_time, Some(now));
        assert_eq!(run.measurement_end_time, Some(now));
        Ok(())
    }

    #[test]
    fn finish_records_reason() -> Result<()> {
        let mut run = record();
        let now = Utc::now();
        run.transition_to(RunStatus::Running, now)?;
        run.finish(RunStatus::Failed, RunReason::WorkerFailure, "worker-2 dead", now)?;
        assert_eq!(run.reason, Some(RunReason::WorkerFailure));
        assert_eq!(run.reason_message.as_deref(), Some("worker-2 dead"));
        Ok(())
    }

    #[test]
    fn reason_labels_are_snake_case() {
        assert_eq!(RunReason::ResourceExhaustion.as_label(), "resource_exhaustion");
        let json = serde_json::to_string(&RunReason::BoundsLimitReached).unwrap();
        assert_eq!(json, "\"BOUNDS_LIMIT_REACHED\"");
    }
}
