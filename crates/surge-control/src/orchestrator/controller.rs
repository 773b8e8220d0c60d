//! Per-run controller state and the pure decisions taken on each tick.
//!
//! Everything here is synchronous. The orchestrator reads the store, calls
//! into these functions, and issues the writes they ask for.

use std::time::Duration;

use chrono::{DateTime, Utc};

use surge_core::WorkerId;

use crate::aggregation::SnapshotWatermark;
use crate::config::{LoadMode, WorkerFailurePolicy};
use crate::guardrail::WorkerLoad;
use crate::heartbeat::{ClassifiedWorker, WorkerHealth, WorkerStatus};
use crate::run::{DrainOutcome, RunPhase, RunReason, RunRecord};
use crate::scaling::GroupTargets;
use crate::scaling::step::StepOutcome;

/// In-memory state of one run's controller.
///
/// Lost on orchestrator restart. Streaks start over, and the first tick
/// after a restart always aggregates.
#[derive(Debug, Default)]
pub struct RunController {
    /// Consecutive ticks with the whole fleet over a guardrail threshold.
    pub fleet_breach_streak: u32,
    /// Consecutive below-target evaluations with every worker at the ceiling.
    pub throughput_streak: u32,
    /// Inputs of the last live aggregation.
    pub last_aggregation: Option<AggregationKey>,
}

/// What a live aggregation depended on.
///
/// The tick re-aggregates only when new snapshots arrived or a worker
/// crossed into `DEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationKey {
    /// Fingerprint of the latest-snapshot set.
    pub watermark: SnapshotWatermark,
    /// Number of workers classified dead.
    pub dead_workers: usize,
}

impl RunController {
    /// Returns true if `key` differs from the inputs of the last aggregation
    /// that was persisted.
    #[must_use]
    pub fn needs_aggregation(&self, key: AggregationKey) -> bool {
        self.last_aggregation != Some(key)
    }
}

fn elapsed(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    since
        .and_then(|at| (now - at).to_std().ok())
        .unwrap_or_default()
}

/// The phase the run's schedule says it should move to next, if its
/// boundary has passed.
///
/// In find-max mode measurement ends when the step controller concludes,
/// not after `duration`.
#[must_use]
pub fn due_phase(run: &RunRecord, now: DateTime<Utc>) -> Option<RunPhase> {
    let scenario = &run.scenario;
    match run.phase {
        RunPhase::Warmup if run.elapsed_since_start(now) >= scenario.warmup => {
            Some(RunPhase::Measurement)
        }
        RunPhase::Measurement => {
            let finished = match &scenario.load {
                LoadMode::FindMax(_) => run
                    .step_controller_state
                    .as_ref()
                    .is_some_and(|state| state.conclusion.is_some()),
                _ => elapsed(run.warmup_end_time, now) >= scenario.duration,
            };
            finished.then_some(RunPhase::Cooldown)
        }
        RunPhase::Cooldown if run.elapsed_since_measurement_end(now) >= scenario.cooldown => {
            Some(RunPhase::Processing)
        }
        _ => None,
    }
}

/// Reason and message recorded when the schedule runs to its end.
#[must_use]
pub fn completion_reason(run: &RunRecord) -> (RunReason, String) {
    let Some(conclusion) = run
        .step_controller_state
        .as_ref()
        .and_then(|state| state.conclusion)
    else {
        return (RunReason::Completed, "schedule finished".to_string());
    };

    let reason = if conclusion.outcome == StepOutcome::BoundsLimitReached {
        RunReason::BoundsLimitReached
    } else {
        RunReason::CapacityFound
    };
    let message = match conclusion.result {
        Some(result) => format!(
            "{}: highest stable step {} at {} connections ({:.1} qps, p95 {:.1}ms)",
            conclusion.outcome,
            result.step_number,
            result.target_connections,
            result.qps,
            result.p95
        ),
        None => format!("{}: no step was stable", conclusion.outcome),
    };
    (reason, message)
}

/// Applies the worker-failure policy to a heartbeat sweep.
///
/// Returns the failure message if the run must fail.
#[must_use]
pub fn worker_failure(
    policy: WorkerFailurePolicy,
    workers: &[ClassifiedWorker],
    expected_workers: u32,
) -> Option<String> {
    let dead: Vec<&WorkerId> = workers
        .iter()
        .filter(|w| w.health == WorkerHealth::Dead)
        .map(|w| &w.heartbeat.worker_id)
        .collect();
    if dead.is_empty() {
        return None;
    }

    let names = dead
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    match policy {
        WorkerFailurePolicy::AnyDeath => Some(format!("worker(s) dead: {names}")),
        WorkerFailurePolicy::FleetWide => {
            let all_dead = u32::try_from(dead.len()).unwrap_or(u32::MAX) >= expected_workers;
            all_dead.then(|| format!("all {expected_workers} expected workers dead: {names}"))
        }
    }
}

/// Decides whether a two-phase stop is over.
///
/// Graceful once every worker reported `COMPLETED` or went away; forced
/// once `drain_timeout` has elapsed since the stop request.
#[must_use]
pub fn drain_outcome(
    workers: &[ClassifiedWorker],
    since_cancel: Duration,
    drain_timeout: Duration,
) -> Option<DrainOutcome> {
    let drained = workers.iter().all(|w| {
        w.heartbeat.status == WorkerStatus::Completed || w.health == WorkerHealth::Dead
    });
    if drained {
        Some(DrainOutcome::Graceful)
    } else if since_cancel >= drain_timeout {
        Some(DrainOutcome::Forced)
    } else {
        None
    }
}

/// Builds the guardrail's view of the live, loaded fleet.
///
/// Each worker is judged against its slot's authoritative target, falling
/// back to the target it last reported.
#[must_use]
pub fn worker_loads(workers: &[ClassifiedWorker], targets: &GroupTargets) -> Vec<WorkerLoad> {
    workers
        .iter()
        .filter(|w| w.health.is_live() && w.heartbeat.status == WorkerStatus::Running)
        .map(|w| {
            let hb = &w.heartbeat;
            WorkerLoad {
                worker_id: hb.worker_id.clone(),
                worker_group_id: hb.worker_group_id,
                target_connections: targets
                    .get(&hb.worker_group_id)
                    .copied()
                    .unwrap_or(hb.target_connections),
                usage: hb.resources,
            }
        })
        .collect()
}

/// Slots whose target differs between `before` and `after`.
#[must_use]
pub fn changed_targets(before: &GroupTargets, after: &GroupTargets) -> GroupTargets {
    after
        .iter()
        .filter(|&(group, target)| before.get(group) != Some(target))
        .map(|(group, target)| (*group, *target))
        .collect()
}
