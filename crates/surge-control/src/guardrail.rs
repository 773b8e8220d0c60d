//! Resource guardrail policy.
//!
//! A pure decision function over per-worker CPU/memory telemetry. The
//! caller owns the consecutive fleet-wide breach counter and passes it in;
//! the policy returns the updated counter with its decision.
//!
//! A back-off sheds `backoff_pct` of every offender's target. The total is
//! spread over the offending slots with [`scale_down`], so no slot drops
//! below the floor and a slot's shortfall moves to the next offender.
//!
//! | Workers over threshold | `soft` mode | `hard` mode |
//! |------------------------|-------------|-------------|
//! | none | no action | no action |
//! | some | back off offenders, scale out or degrade | fail |
//! | some, all at the floor | degrade | fail |
//! | all, streak < patience | warn | fail |
//! | all, streak >= patience | fail | fail |

use serde::{Deserialize, Serialize};

use surge_core::{WorkerGroupId, WorkerId};

use crate::config::ScalingBounds;
use crate::error::{Error, Result};
use crate::heartbeat::ResourceUsage;
use crate::scaling::{GroupTargets, scale_down};

/// How strictly breaches are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailMode {
    /// Back off and adapt; only sustained fleet-wide breach is fatal.
    #[default]
    Soft,
    /// Any breach is fatal.
    Hard,
}

/// Guardrail thresholds and reactions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailConfig {
    /// CPU utilisation above which a worker is in breach, percent.
    pub cpu_threshold_pct: f64,
    /// Memory utilisation above which a worker is in breach, percent.
    pub memory_threshold_pct: f64,
    /// Breach handling mode.
    #[serde(default)]
    pub mode: GuardrailMode,
    /// Share of an offending worker's target shed per back-off, percent.
    pub backoff_pct: f64,
    /// Consecutive fleet-wide breach ticks tolerated before failing.
    pub patience_intervals: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_pct: 90.0,
            memory_threshold_pct: 90.0,
            mode: GuardrailMode::Soft,
            backoff_pct: 25.0,
            patience_intervals: 3,
        }
    }
}

impl GuardrailConfig {
    /// Static validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for out-of-range percentages or a
    /// zero patience.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("cpuThresholdPct", self.cpu_threshold_pct),
            ("memoryThresholdPct", self.memory_threshold_pct),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(Error::config_invalid(format!(
                    "guardrails.{name} must be in (0, 100], got {value}"
                )));
            }
        }
        if !(self.backoff_pct > 0.0 && self.backoff_pct < 100.0) {
            return Err(Error::config_invalid(format!(
                "guardrails.backoffPct must be in (0, 100), got {}",
                self.backoff_pct
            )));
        }
        if self.patience_intervals == 0 {
            return Err(Error::config_invalid(
                "guardrails.patienceIntervals must be at least 1",
            ));
        }
        Ok(())
    }

    /// Describes why `usage` breaches the thresholds, if it does.
    #[must_use]
    pub fn breach(&self, usage: &ResourceUsage) -> Option<String> {
        if usage.cpu_pct > self.cpu_threshold_pct {
            Some(format!(
                "cpu {:.1}% over {:.1}%",
                usage.cpu_pct, self.cpu_threshold_pct
            ))
        } else if usage.memory_pct > self.memory_threshold_pct {
            Some(format!(
                "memory {:.1}% over {:.1}%",
                usage.memory_pct, self.memory_threshold_pct
            ))
        } else {
            None
        }
    }

    /// Connections one back-off sheds from `current`, ignoring the floor.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )] // bounded by `current`
    pub fn shed_connections(&self, current: u32) -> u32 {
        let keep = (1.0 - self.backoff_pct / 100.0).clamp(0.0, 1.0);
        let kept = (f64::from(current) * keep).floor() as u32;
        current.saturating_sub(kept)
    }
}

/// One live worker's load as seen by the guardrail.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLoad {
    /// Worker identity.
    pub worker_id: WorkerId,
    /// Slot of the worker.
    pub worker_group_id: WorkerGroupId,
    /// Authoritative target of the worker's slot.
    pub target_connections: u32,
    /// Latest telemetry; workers without telemetry are never in breach.
    pub usage: Option<ResourceUsage>,
}

/// A back-off for one offending worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDown {
    /// Offending worker.
    pub worker_id: WorkerId,
    /// Slot of the offending worker.
    pub worker_group_id: WorkerGroupId,
    /// Target before the back-off.
    pub from: u32,
    /// Absolute target after the back-off.
    pub to: u32,
    /// Which threshold was breached.
    pub reason: String,
}

/// How shed load is re-absorbed after a back-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Launch one more worker at the floor target.
    ScaleOut {
        /// Slot of the new worker.
        worker_group_id: WorkerGroupId,
        /// Initial target of the new worker.
        target_connections: u32,
    },
    /// Fleet is at its size limit; continue at reduced capacity.
    Degraded,
}

/// What the guardrail wants done this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailDecision {
    /// Nothing to do.
    None,
    /// Back off offending workers and compensate.
    BackOff {
        /// One entry per offending worker whose target can still shrink.
        scale_downs: Vec<ScaleDown>,
        /// How the shed load is re-absorbed.
        compensation: Compensation,
    },
    /// Some workers are over threshold but every one of them is already
    /// at the floor; the run continues degraded.
    AtFloor {
        /// Workers in breach.
        breached_workers: u32,
        /// Which threshold the first offender breached.
        reason: String,
    },
    /// Whole fleet over threshold, still within patience.
    Warn {
        /// Workers in breach.
        breached_workers: u32,
        /// Consecutive fleet-wide breach ticks, including this one.
        consecutive_ticks: u32,
        /// Ticks tolerated before failing.
        patience: u32,
    },
    /// Fail the run with `ResourceExhaustion`.
    Fail {
        /// Human-readable detail.
        message: String,
    },
}

impl GuardrailDecision {
    /// Label used for the guardrail action metric.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BackOff { .. } => "scale_down",
            Self::AtFloor { .. } => "at_floor",
            Self::Warn { .. } => "warning",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Decision plus the updated fleet-wide breach streak.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailOutcome {
    /// What to do.
    pub decision: GuardrailDecision,
    /// Streak to carry into the next tick.
    pub fleet_breach_streak: u32,
}

/// Evaluates the guardrail for one tick.
///
/// `workers` is the live fleet. `expected_workers` is the current fleet
/// size, used both as the next free slot and against `bounds.max_workers`.
#[must_use]
pub fn evaluate(
    config: &GuardrailConfig,
    workers: &[WorkerLoad],
    bounds: &ScalingBounds,
    expected_workers: u32,
    fleet_breach_streak: u32,
) -> GuardrailOutcome {
    let breaches: Vec<(&WorkerLoad, String)> = workers
        .iter()
        .filter_map(|w| {
            w.usage
                .as_ref()
                .and_then(|usage| config.breach(usage))
                .map(|reason| (w, reason))
        })
        .collect();

    if breaches.is_empty() {
        return GuardrailOutcome {
            decision: GuardrailDecision::None,
            fleet_breach_streak: 0,
        };
    }

    let breached = u32::try_from(breaches.len()).unwrap_or(u32::MAX);
    let fleet_wide = breaches.len() == workers.len();

    if config.mode == GuardrailMode::Hard {
        let (worker, reason) = &breaches[0];
        return GuardrailOutcome {
            decision: GuardrailDecision::Fail {
                message: format!(
                    "{breached} worker(s) over threshold in hard mode ({}: {reason})",
                    worker.worker_id
                ),
            },
            fleet_breach_streak: if fleet_wide {
                fleet_breach_streak.saturating_add(1)
            } else {
                0
            },
        };
    }

    if fleet_wide {
        let streak = fleet_breach_streak.saturating_add(1);
        let decision = if streak >= config.patience_intervals {
            GuardrailDecision::Fail {
                message: format!(
                    "all {breached} workers over threshold for {streak} consecutive ticks"
                ),
            }
        } else {
            GuardrailDecision::Warn {
                breached_workers: breached,
                consecutive_ticks: streak,
                patience: config.patience_intervals,
            }
        };
        return GuardrailOutcome {
            decision,
            fleet_breach_streak: streak,
        };
    }

    let floor = bounds.min_connections_per_worker;
    let current: GroupTargets = breaches
        .iter()
        .map(|(worker, _)| (worker.worker_group_id, worker.target_connections))
        .collect();
    let shed = breaches
        .iter()
        .map(|(worker, _)| config.shed_connections(worker.target_connections))
        .fold(0_u32, u32::saturating_add);
    let reduced = scale_down(&current, shed, floor);

    let first_reason = breaches[0].1.clone();
    let scale_downs: Vec<ScaleDown> = breaches
        .into_iter()
        .filter_map(|(worker, reason)| {
            let to = reduced.targets.get(&worker.worker_group_id).copied()?;
            (to < worker.target_connections).then(|| ScaleDown {
                worker_id: worker.worker_id.clone(),
                worker_group_id: worker.worker_group_id,
                from: worker.target_connections,
                to,
                reason,
            })
        })
        .collect();

    if scale_downs.is_empty() {
        return GuardrailOutcome {
            decision: GuardrailDecision::AtFloor {
                breached_workers: breached,
                reason: first_reason,
            },
            fleet_breach_streak: 0,
        };
    }

    let compensation = if expected_workers < bounds.max_workers {
        Compensation::ScaleOut {
            worker_group_id: WorkerGroupId::new(expected_workers),
            target_connections: floor,
        }
    } else {
        Compensation::Degraded
    };

    GuardrailOutcome {
        decision: GuardrailDecision::BackOff {
            scale_downs,
            compensation,
        },
        fleet_breach_streak: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(id: u32, target: u32, cpu: f64) -> WorkerLoad {
        WorkerLoad {
            worker_id: WorkerId::new(format!("w-{id}")),
            worker_group_id: WorkerGroupId::new(id),
            target_connections: target,
            usage: Some(ResourceUsage {
                cpu_pct: cpu,
                memory_pct: 10.0,
            }),
        }
    }

    fn bounds(max_workers: u32) -> ScalingBounds {
        ScalingBounds {
            min_connections_per_worker: 2,
            max_connections_per_worker: 20,
            max_workers,
        }
    }

    #[test]
    fn no_breach_resets_streak() {
        let workers = [load(0, 10, 50.0), load(1, 10, 60.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(4), 2, 2);
        assert_eq!(outcome.decision, GuardrailDecision::None);
        assert_eq!(outcome.fleet_breach_streak, 0);
    }

    #[test]
    fn partial_breach_backs_off_and_scales_out() {
        let workers = [load(0, 10, 50.0), load(1, 10, 97.0), load(2, 10, 40.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(4), 3, 0);
        let GuardrailDecision::BackOff {
            scale_downs,
            compensation,
        } = outcome.decision
        else {
            panic!("expected back-off");
        };
        assert_eq!(scale_downs.len(), 1);
        assert_eq!(scale_downs[0].worker_id, WorkerId::new("w-1"));
        assert_eq!(scale_downs[0].to, 7);
        assert_eq!(
            compensation,
            Compensation::ScaleOut {
                worker_group_id: WorkerGroupId::new(3),
                target_connections: 2
            }
        );
    }

    #[test]
    fn partial_breach_at_max_workers_degrades() {
        let workers = [load(0, 10, 95.0), load(1, 10, 40.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(2), 2, 0);
        assert!(matches!(
            outcome.decision,
            GuardrailDecision::BackOff {
                compensation: Compensation::Degraded,
                ..
            }
        ));
    }

    #[test]
    fn back_off_never_goes_below_floor() {
        let config = GuardrailConfig::default();
        assert_eq!(config.shed_connections(3), 1);
        assert_eq!(config.shed_connections(100), 25);
        let workers = [load(0, 2, 95.0), load(1, 10, 40.0)];
        let outcome = evaluate(&config, &workers, &bounds(4), 2, 0);
        assert_eq!(
            outcome.decision,
            GuardrailDecision::AtFloor {
                breached_workers: 1,
                reason: "cpu 95.0% over 90.0%".into(),
            }
        );
        assert_eq!(outcome.fleet_breach_streak, 0);
    }

    #[test]
    fn shortfall_at_the_floor_moves_to_the_next_offender() {
        let workers = [load(0, 3, 95.0), load(1, 10, 40.0), load(2, 10, 97.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(4), 3, 0);
        let GuardrailDecision::BackOff { scale_downs, .. } = outcome.decision else {
            panic!("expected back-off");
        };
        // Four connections shed in total: one from slot 0, three from slot 2.
        let moved: Vec<(u32, u32)> = scale_downs.iter().map(|d| (d.from, d.to)).collect();
        assert_eq!(moved, vec![(3, 2), (10, 7)]);

        let workers = [load(0, 2, 95.0), load(1, 10, 40.0), load(2, 10, 97.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(4), 3, 0);
        let GuardrailDecision::BackOff { scale_downs, .. } = outcome.decision else {
            panic!("expected back-off");
        };
        assert_eq!(scale_downs.len(), 1);
        assert_eq!(scale_downs[0].worker_group_id, WorkerGroupId::new(2));
        assert_eq!(scale_downs[0].to, 6);
    }

    #[test]
    fn fleet_wide_breach_warns_then_fails() {
        let config = GuardrailConfig {
            patience_intervals: 3,
            ..GuardrailConfig::default()
        };
        let workers = [load(0, 10, 95.0), load(1, 10, 96.0)];
        let mut streak = 0;
        for expected in 1..3 {
            let outcome = evaluate(&config, &workers, &bounds(4), 2, streak);
            assert!(matches!(
                outcome.decision,
                GuardrailDecision::Warn { consecutive_ticks, .. } if consecutive_ticks == expected
            ));
            streak = outcome.fleet_breach_streak;
        }
        let outcome = evaluate(&config, &workers, &bounds(4), 2, streak);
        assert!(matches!(outcome.decision, GuardrailDecision::Fail { .. }));
    }

    #[test]
    fn hard_mode_fails_on_any_breach() {
        let config = GuardrailConfig {
            mode: GuardrailMode::Hard,
            ..GuardrailConfig::default()
        };
        let workers = [load(0, 10, 95.0), load(1, 10, 40.0)];
        let outcome = evaluate(&config, &workers, &bounds(4), 2, 0);
        assert!(matches!(outcome.decision, GuardrailDecision::Fail { .. }));
    }

    #[test]
    fn workers_without_telemetry_never_breach() {
        let mut quiet = load(0, 10, 0.0);
        quiet.usage = None;
        let workers = [quiet, load(1, 10, 99.0)];
        let outcome = evaluate(&GuardrailConfig::default(), &workers, &bounds(4), 2, 0);
        assert!(matches!(outcome.decision, GuardrailDecision::BackOff { .. }));
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let bad = GuardrailConfig {
            backoff_pct: 100.0,
            ..GuardrailConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = GuardrailConfig {
            patience_intervals: 0,
            ..GuardrailConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(GuardrailConfig::default().validate().is_ok());
    }
}
