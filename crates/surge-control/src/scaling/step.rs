//! Capacity discovery by step load (find-max mode).
//!
//! Step 1 runs at `start_connections` and sets the baseline P95. Every
//! later step runs for `step_duration` and is then checked, in order, for:
//!
//! 1. window error rate above `error_rate_ceiling_pct` (`ERROR_THRESHOLD`);
//! 2. an external queueing signal (`QUEUE_DETECTED`);
//! 3. throughput below the last stable step by more than
//!    `qps_stability_pct`, or P95 drift from the baseline above
//!    `latency_stability_pct` (`DEGRADED`).
//!
//! A stable step advances total load by `step_increment`; if that would
//! pass `max_connections` discovery ends with `BOUNDS_LIMIT_REACHED` and
//! the current step as the result. An unstable step ends discovery with the
//! last stable step as the result. Every evaluation yields a [`StepRecord`]
//! that the orchestrator persists before acting on it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::RunId;

use crate::aggregation::AggregateMetrics;
use crate::config::{LoadMode, ScenarioConfig};
use crate::error::{Error, Result};

const fn default_qps_stability_pct() -> f64 {
    10.0
}

const fn default_latency_stability_pct() -> f64 {
    20.0
}

const fn default_error_rate_ceiling_pct() -> f64 {
    1.0
}

/// Find-max scenario settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindMaxConfig {
    /// Total connections of step 1.
    pub start_connections: u32,
    /// Total connections added per stable step.
    pub step_increment: u32,
    /// Upper bound on total connections.
    pub max_connections: u32,
    /// Dwell time of each step before it is evaluated.
    #[serde(with = "humantime_serde")]
    pub step_duration: Duration,
    /// Allowed throughput drop versus the last stable step, percent.
    #[serde(default = "default_qps_stability_pct")]
    pub qps_stability_pct: f64,
    /// Allowed P95 drift above the baseline, percent.
    #[serde(default = "default_latency_stability_pct")]
    pub latency_stability_pct: f64,
    /// Highest tolerated window error rate, percent.
    #[serde(default = "default_error_rate_ceiling_pct")]
    pub error_rate_ceiling_pct: f64,
}

impl FindMaxConfig {
    /// Settings with default stability bands.
    #[must_use]
    pub const fn new(
        start_connections: u32,
        step_increment: u32,
        max_connections: u32,
        step_duration: Duration,
    ) -> Self {
        Self {
            start_connections,
            step_increment,
            max_connections,
            step_duration,
            qps_stability_pct: default_qps_stability_pct(),
            latency_stability_pct: default_latency_stability_pct(),
            error_rate_ceiling_pct: default_error_rate_ceiling_pct(),
        }
    }

    /// Static validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.start_connections == 0 || self.step_increment == 0 {
            return Err(Error::config_invalid(
                "find-max startConnections and stepIncrement must be at least 1",
            ));
        }
        if self.start_connections > self.max_connections {
            return Err(Error::config_invalid(format!(
                "find-max startConnections {} exceeds maxConnections {}",
                self.start_connections, self.max_connections
            )));
        }
        if self.step_duration.is_zero() {
            return Err(Error::config_invalid("find-max stepDuration must be greater than zero"));
        }
        for (name, value) in [
            ("qpsStabilityPct", self.qps_stability_pct),
            ("latencyStabilityPct", self.latency_stability_pct),
            ("errorRateCeilingPct", self.error_rate_ceiling_pct),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::config_invalid(format!(
                    "find-max {name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Verdict attached to a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Step 1 passed and set the baseline.
    Baseline,
    /// Stable; load advanced to the next step.
    Advanced,
    /// Throughput fell or latency drifted out of band.
    Degraded,
    /// Error rate above the ceiling.
    ErrorThreshold,
    /// The external queue signal fired.
    QueueDetected,
    /// Stable, but the next step would pass the configured maximum.
    BoundsLimitReached,
}

impl StepOutcome {
    /// Returns true if the step itself was stable.
    #[must_use]
    pub const fn is_stable(&self) -> bool {
        matches!(
            self,
            Self::Baseline | Self::Advanced | Self::BoundsLimitReached
        )
    }

    /// Snake-case label for metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Advanced => "advanced",
            Self::Degraded => "degraded",
            Self::ErrorThreshold => "error_threshold",
            Self::QueueDetected => "queue_detected",
            Self::BoundsLimitReached => "bounds_limit_reached",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A step that passed every stability check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StableStep {
    /// Step number, from 1.
    pub step_number: u32,
    /// Total connections of the step.
    pub target_connections: u32,
    /// Aggregate throughput measured in the step.
    pub qps: f64,
    /// Aggregate P95 measured in the step.
    pub p95: f64,
}

/// How discovery ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConclusion {
    /// Outcome of the last evaluated step.
    pub outcome: StepOutcome,
    /// Highest stable step, if any step was stable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StableStep>,
    /// When discovery ended.
    pub concluded_at: DateTime<Utc>,
}

/// Persisted discovery state, stored on the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepControllerState {
    /// Current step, from 1.
    pub step_number: u32,
    /// Total connections of the current step.
    pub target_connections: u32,
    /// When the current step's window opened.
    pub step_started_at: DateTime<Utc>,
    /// Aggregate operation count when the window opened.
    pub ops_at_step_start: u64,
    /// Aggregate error count when the window opened.
    pub errors_at_step_start: u64,
    /// P95 measured by step 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_p95: Option<f64>,
    /// Highest stable step so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stable: Option<StableStep>,
    /// Set once discovery has ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<StepConclusion>,
}

/// Window metrics of one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    /// Aggregate throughput at evaluation.
    pub qps: f64,
    /// Aggregate P50 at evaluation.
    pub p50: f64,
    /// Aggregate P95 at evaluation.
    pub p95: f64,
    /// Aggregate P99 at evaluation.
    pub p99: f64,
    /// Operations completed inside the window.
    pub window_ops: u64,
    /// Errors inside the window.
    pub window_errors: u64,
    /// Window error rate, percent.
    pub error_rate_pct: f64,
    /// Workers that contributed.
    pub worker_count: u32,
}

/// Immutable history entry for one evaluated step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Owning run.
    pub run_id: RunId,
    /// Step number, from 1.
    pub step_number: u32,
    /// Total connections of the step.
    pub target_connections: u32,
    /// Window open time.
    pub window_start: DateTime<Utc>,
    /// Evaluation time.
    pub window_end: DateTime<Utc>,
    /// Window metrics.
    pub metrics: StepMetrics,
    /// Baseline P95 the step was judged against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_p95: Option<f64>,
    /// P95 drift from the baseline, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_drift_pct: Option<f64>,
    /// Whether the step passed every check.
    pub stable: bool,
    /// Outcome of the evaluation.
    pub outcome: StepOutcome,
    /// Human-readable detail.
    pub message: String,
}

/// What the orchestrator must do after persisting the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepAction {
    /// Re-allocate to a larger total.
    Advance {
        /// New total connections.
        target_connections: u32,
    },
    /// Stop discovery and end measurement.
    Conclude(StepConclusion),
}

/// Result of evaluating one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvaluation {
    /// History entry to persist first.
    pub record: StepRecord,
    /// State to store on the run afterwards.
    pub state: StepControllerState,
    /// Follow-up action.
    pub action: StepAction,
}

/// Stateless evaluator; all state lives in [`StepControllerState`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepController {
    config: FindMaxConfig,
}

impl StepController {
    /// Creates a controller.
    #[must_use]
    pub const fn new(config: FindMaxConfig) -> Self {
        Self { config }
    }

    /// Builds a controller if the scenario is in find-max mode.
    #[must_use]
    pub fn from_scenario(scenario: &ScenarioConfig) -> Option<Self> {
        match &scenario.load {
            LoadMode::FindMax(config) => Some(Self::new(config.clone())),
            _ => None,
        }
    }

    /// The settings.
    #[must_use]
    pub const fn config(&self) -> &FindMaxConfig {
        &self.config
    }

    /// Opens step 1 at `now`.
    #[must_use]
    pub const fn begin(&self, now: DateTime<Utc>) -> StepControllerState {
        StepControllerState {
            step_number: 1,
            target_connections: self.config.start_connections,
            step_started_at: now,
            ops_at_step_start: 0,
            errors_at_step_start: 0,
            baseline_p95: None,
            last_stable: None,
            conclusion: None,
        }
    }

    /// Returns true once the step has dwelt long enough and the aggregate
    /// contains data reported after the window opened.
    #[must_use]
    pub fn is_due(
        &self,
        state: &StepControllerState,
        aggregate: Option<&AggregateMetrics>,
        now: DateTime<Utc>,
    ) -> bool {
        if state.conclusion.is_some() {
            return false;
        }
        let dwelt = (now - state.step_started_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.config.step_duration);
        let fresh = aggregate
            .and_then(|a| a.newest_snapshot_at)
            .is_some_and(|at| at > state.step_started_at);
        dwelt && fresh
    }

    /// Evaluates the current step against `aggregate`.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn evaluate(
        &self,
        run_id: RunId,
        state: &StepControllerState,
        aggregate: &AggregateMetrics,
        queue_detected: bool,
        now: DateTime<Utc>,
    ) -> StepEvaluation {
        let metrics = window_metrics(state, aggregate);
        let is_baseline = state.step_number == 1 || state.baseline_p95.is_none();
        let baseline_p95 = if is_baseline {
            Some(metrics.p95)
        } else {
            state.baseline_p95
        };
        let drift = if is_baseline {
            None
        } else {
            baseline_p95.map(|base| drift_pct(base, metrics.p95))
        };

        let failure = self.first_failure(state, &metrics, drift, queue_detected);
        let current = StableStep {
            step_number: state.step_number,
            target_connections: state.target_connections,
            qps: metrics.qps,
            p95: metrics.p95,
        };

        let mut next = state.clone();
        next.baseline_p95 = baseline_p95;

        let (outcome, message, action) = if let Some((outcome, message)) = failure {
            let conclusion = StepConclusion {
                outcome,
                result: state.last_stable,
                concluded_at: now,
            };
            next.conclusion = Some(conclusion);
            (outcome, message, StepAction::Conclude(conclusion))
        } else {
            next.last_stable = Some(current);
            let next_target = state
                .target_connections
                .saturating_add(self.config.step_increment);
            if next_target > self.config.max_connections {
                let conclusion = StepConclusion {
                    outcome: StepOutcome::BoundsLimitReached,
                    result: Some(current),
                    concluded_at: now,
                };
                next.conclusion = Some(conclusion);
                (
                    StepOutcome::BoundsLimitReached,
                    format!(
                        "stable at {} connections; next step {next_target} exceeds maximum {}",
                        state.target_connections, self.config.max_connections
                    ),
                    StepAction::Conclude(conclusion),
                )
            } else {
                next.step_number = state.step_number + 1;
                next.target_connections = next_target;
                next.step_started_at = now;
                next.ops_at_step_start = aggregate.total_ops;
                next.errors_at_step_start = aggregate.error_count;
                let outcome = if is_baseline {
                    StepOutcome::Baseline
                } else {
                    StepOutcome::Advanced
                };
                (
                    outcome,
                    format!(
                        "stable at {} connections; advancing to {next_target}",
                        state.target_connections
                    ),
                    StepAction::Advance {
                        target_connections: next_target,
                    },
                )
            }
        };

        let record = StepRecord {
            run_id,
            step_number: state.step_number,
            target_connections: state.target_connections,
            window_start: state.step_started_at,
            window_end: now,
            metrics,
            baseline_p95,
            latency_drift_pct: drift,
            stable: outcome.is_stable(),
            outcome,
            message,
        };

        StepEvaluation {
            record,
            state: next,
            action,
        }
    }

    fn first_failure(
        &self,
        state: &StepControllerState,
        metrics: &StepMetrics,
        drift: Option<f64>,
        queue_detected: bool,
    ) -> Option<(StepOutcome, String)> {
        let cfg = &self.config;
        if metrics.error_rate_pct > cfg.error_rate_ceiling_pct {
            return Some((
                StepOutcome::ErrorThreshold,
                format!(
                    "error rate {:.2}% above ceiling {:.2}%",
                    metrics.error_rate_pct, cfg.error_rate_ceiling_pct
                ),
            ));
        }
        if queue_detected {
            return Some((
                StepOutcome::QueueDetected,
                "external queueing signal observed".to_string(),
            ));
        }
        if let Some(prior) = state.last_stable {
            let floor = prior.qps * (1.0 - cfg.qps_stability_pct / 100.0);
            if metrics.qps < floor {
                return Some((
                    StepOutcome::Degraded,
                    format!(
                        "throughput {:.1} fell below {:.1} ({}% under step {})",
                        metrics.qps, floor, cfg.qps_stability_pct, prior.step_number
                    ),
                ));
            }
        }
        if let Some(drift) = drift {
            if drift > cfg.latency_stability_pct {
                return Some((
                    StepOutcome::Degraded,
                    format!(
                        "p95 {:.1}ms drifted {drift:.1}% from baseline (limit {}%)",
                        metrics.p95, cfg.latency_stability_pct
                    ),
                ));
            }
        }
        None
    }
}

/// Percent by which `p95` exceeds `baseline` (negative when faster).
#[must_use]
pub fn drift_pct(baseline: f64, p95: f64) -> f64 {
    if baseline <= 0.0 {
        0.0
    } else {
        (p95 - baseline) / baseline * 100.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn window_metrics(state: &StepControllerState, aggregate: &AggregateMetrics) -> StepMetrics {
    let window_ops = aggregate.total_ops.saturating_sub(state.ops_at_step_start);
    let window_errors = aggregate.error_count.saturating_sub(state.errors_at_step_start);
    let error_rate_pct = if window_ops == 0 {
        0.0
    } else {
        window_errors as f64 / window_ops as f64 * 100.0
    };
    StepMetrics {
        qps: aggregate.qps,
        p50: aggregate.latency.p50,
        p95: aggregate.latency.p95,
        p99: aggregate.latency.p99,
        window_ops,
        window_errors,
        error_rate_pct,
        worker_count: u32::try_from(aggregate.worker_count()).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationPass;
    use chrono::Duration as ChronoDuration;
    use surge_core::WorkerId;

    fn controller() -> StepController {
        StepController::new(FindMaxConfig::new(100, 100, 400, Duration::from_secs(30)))
    }

    fn aggregate(qps: f64, p95: f64, ops: u64, errors: u64, at: DateTime<Utc>) -> AggregateMetrics {
        let mut agg = AggregateMetrics::empty(AggregationPass::Live, at);
        agg.qps = qps;
        agg.latency.p95 = p95;
        agg.total_ops = ops;
        agg.error_count = errors;
        agg.newest_snapshot_at = Some(at);
        agg.included_workers = vec![WorkerId::new("w-0")];
        agg
    }

    #[test]
    fn drift_formula() {
        assert!((drift_pct(42.0, 55.0) - 30.952_380_952).abs() < 1e-6);
        assert!((drift_pct(42.0, 48.2) - 14.761_904_761).abs() < 1e-6);
        assert!(drift_pct(0.0, 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn not_due_before_dwell_or_without_fresh_data() {
        let c = controller();
        let start = Utc::now();
        let state = c.begin(start);
        let later = start + ChronoDuration::seconds(31);
        assert!(!c.is_due(&state, None, later));
        let stale = aggregate(100.0, 40.0, 10, 0, start);
        assert!(!c.is_due(&state, Some(&stale), later));
        let fresh = aggregate(100.0, 40.0, 10, 0, start + ChronoDuration::seconds(30));
        assert!(!c.is_due(&state, Some(&fresh), start + ChronoDuration::seconds(10)));
        assert!(c.is_due(&state, Some(&fresh), later));
    }

    #[test]
    fn baseline_then_advance_then_degrade() {
        let c = controller();
        let run_id = RunId::generate();
        let t0 = Utc::now();
        let state = c.begin(t0);

        let t1 = t0 + ChronoDuration::seconds(30);
        let step1 = c.evaluate(run_id, &state, &aggregate(1000.0, 42.0, 30_000, 0, t1), false, t1);
        assert_eq!(step1.record.outcome, StepOutcome::Baseline);
        assert_eq!(step1.state.baseline_p95, Some(42.0));
        assert_eq!(
            step1.action,
            StepAction::Advance {
                target_connections: 200
            }
        );

        let t2 = t1 + ChronoDuration::seconds(30);
        let step2 = c.evaluate(run_id, &step1.state, &aggregate(1900.0, 48.2, 90_000, 0, t2), false, t2);
        assert_eq!(step2.record.outcome, StepOutcome::Advanced);
        assert!(step2.record.stable);
        assert_eq!(step2.record.metrics.window_ops, 60_000);

        let t3 = t2 + ChronoDuration::seconds(30);
        let step3 = c.evaluate(run_id, &step2.state, &aggregate(2600.0, 55.0, 170_000, 0, t3), false, t3);
        assert_eq!(step3.record.outcome, StepOutcome::Degraded);
        assert!(!step3.record.stable);
        let StepAction::Conclude(conclusion) = step3.action else {
            panic!("expected conclusion");
        };
        assert_eq!(conclusion.outcome, StepOutcome::Degraded);
        assert_eq!(conclusion.result.map(|s| s.step_number), Some(2));
        assert_eq!(conclusion.result.map(|s| s.target_connections), Some(200));
    }

    #[test]
    fn errors_checked_before_latency() {
        let c = controller();
        let t0 = Utc::now();
        let mut state = c.begin(t0);
        state.step_number = 2;
        state.baseline_p95 = Some(10.0);
        state.last_stable = Some(StableStep {
            step_number: 1,
            target_connections: 100,
            qps: 100.0,
            p95: 10.0,
        });
        let agg = aggregate(100.0, 100.0, 1000, 50, t0);
        let eval = c.evaluate(RunId::generate(), &state, &agg, true, t0);
        assert_eq!(eval.record.outcome, StepOutcome::ErrorThreshold);
    }

    #[test]
    fn queue_signal_stops_discovery() {
        let c = controller();
        let t0 = Utc::now();
        let state = c.begin(t0);
        let eval = c.evaluate(RunId::generate(), &state, &aggregate(100.0, 5.0, 100, 0, t0), true, t0);
        assert_eq!(eval.record.outcome, StepOutcome::QueueDetected);
        assert!(matches!(
            eval.action,
            StepAction::Conclude(StepConclusion { result: None, .. })
        ));
    }

    #[test]
    fn throughput_drop_is_degraded() {
        let c = controller();
        let t0 = Utc::now();
        let mut state = c.begin(t0);
        state.step_number = 2;
        state.baseline_p95 = Some(10.0);
        state.last_stable = Some(StableStep {
            step_number: 1,
            target_connections: 100,
            qps: 1000.0,
            p95: 10.0,
        });
        let eval = c.evaluate(RunId::generate(), &state, &aggregate(850.0, 10.0, 100, 0, t0), false, t0);
        assert_eq!(eval.record.outcome, StepOutcome::Degraded);
    }

    #[test]
    fn stable_at_maximum_reports_bounds_limit() {
        let c = controller();
        let t0 = Utc::now();
        let mut state = c.begin(t0);
        state.step_number = 4;
        state.target_connections = 400;
        state.baseline_p95 = Some(10.0);
        let eval = c.evaluate(RunId::generate(), &state, &aggregate(4000.0, 10.5, 100, 0, t0), false, t0);
        assert_eq!(eval.record.outcome, StepOutcome::BoundsLimitReached);
        assert!(eval.record.stable);
        let StepAction::Conclude(conclusion) = eval.action else {
            panic!("expected conclusion");
        };
        assert_eq!(conclusion.result.map(|s| s.target_connections), Some(400));
    }

    #[test]
    fn config_validation() {
        assert!(FindMaxConfig::new(100, 100, 400, Duration::from_secs(30)).validate().is_ok());
        assert!(FindMaxConfig::new(500, 100, 400, Duration::from_secs(30)).validate().is_err());
        assert!(FindMaxConfig::new(100, 0, 400, Duration::from_secs(30)).validate().is_err());
        assert!(FindMaxConfig::new(100, 100, 400, Duration::ZERO).validate().is_err());
    }
}
