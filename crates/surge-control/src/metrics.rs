//! Observability metrics for the control plane.
//!
//! All metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `surge_ticks_total` | Counter | `result` | Poll-loop ticks by outcome |
//! | `surge_tick_duration_seconds` | Histogram | - | Poll-loop tick processing time |
//! | `surge_events_emitted_total` | Counter | `event_type` | Control events appended |
//! | `surge_active_runs` | Gauge | - | Runs with a live controller |
//! | `surge_runs_terminal_total` | Counter | `status`, `reason` | Runs reaching a terminal status |
//! | `surge_store_retries_total` | Counter | `operation` | Transient store failures retried |
//! | `surge_guardrail_actions_total` | Counter | `action` | Guardrail decisions other than none |
//! | `surge_step_evaluations_total` | Counter | `verdict` | Capacity-discovery step verdicts |
//! | `surge_aggregate_qps` | Gauge | - | Latest live aggregate throughput |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: poll-loop ticks by outcome.
    pub const TICKS_TOTAL: &str = "surge_ticks_total";
    /// Histogram: poll-loop tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "surge_tick_duration_seconds";
    /// Counter: control events appended, by type.
    pub const EVENTS_EMITTED_TOTAL: &str = "surge_events_emitted_total";
    /// Gauge: runs with a live controller.
    pub const ACTIVE_RUNS: &str = "surge_active_runs";
    /// Counter: runs reaching a terminal status.
    pub const RUNS_TERMINAL_TOTAL: &str = "surge_runs_terminal_total";
    /// Counter: transient store failures that were retried.
    pub const STORE_RETRIES_TOTAL: &str = "surge_store_retries_total";
    /// Counter: guardrail decisions that required action.
    pub const GUARDRAIL_ACTIONS_TOTAL: &str = "surge_guardrail_actions_total";
    /// Counter: capacity-discovery step verdicts.
    pub const STEP_EVALUATIONS_TOTAL: &str = "surge_step_evaluations_total";
    /// Gauge: latest live aggregate throughput.
    pub const AGGREGATE_QPS: &str = "surge_aggregate_qps";
}

/// Label keys used across metrics.
pub mod labels {
    /// Tick outcome (ok, error).
    pub const RESULT: &str = "result";
    /// Control event type.
    pub const EVENT_TYPE: &str = "event_type";
    /// Terminal run status.
    pub const STATUS: &str = "status";
    /// Terminal run reason.
    pub const REASON: &str = "reason";
    /// Store operation name.
    pub const OPERATION: &str = "operation";
    /// Guardrail action kind.
    pub const ACTION: &str = "action";
    /// Step verdict.
    pub const VERDICT: &str = "verdict";
}

/// High-level interface for recording control-plane metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlMetrics;

impl ControlMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a finished tick.
    pub fn record_tick(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        counter!(names::TICKS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records tick duration.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records an appended control event.
    pub fn record_event(&self, event_type: &'static str) {
        counter!(names::EVENTS_EMITTED_TOTAL, labels::EVENT_TYPE => event_type).increment(1);
    }

    /// Sets the number of runs with a live controller.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_active_runs(&self, count: usize) {
        gauge!(names::ACTIVE_RUNS).set(count as f64);
    }

    /// Records a run reaching a terminal status.
    pub fn record_terminal(&self, status: &str, reason: &'static str) {
        counter!(
            names::RUNS_TERMINAL_TOTAL,
            labels::STATUS => status.to_string(),
            labels::REASON => reason,
        )
        .increment(1);
    }

    /// Records a guardrail decision that required action.
    pub fn record_guardrail_action(&self, action: &'static str) {
        counter!(names::GUARDRAIL_ACTIONS_TOTAL, labels::ACTION => action).increment(1);
    }

    /// Records a capacity-discovery step verdict.
    pub fn record_step_evaluation(&self, verdict: &'static str) {
        counter!(names::STEP_EVALUATIONS_TOTAL, labels::VERDICT => verdict).increment(1);
    }

    /// Sets the latest live aggregate throughput.
    pub fn set_aggregate_qps(&self, qps: f64) {
        gauge!(names::AGGREGATE_QPS).set(qps);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records poll-loop tick duration.
#[must_use]
pub fn time_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| ControlMetrics::new().observe_tick_duration(duration))
}
