//! Custom assertion helpers for integration tests.

use surge_control::events::{ControlEvent, EventType};
use surge_control::run::{RunReason, RunRecord, RunStatus};

/// Asserts that a run is terminal with the given status and reason.
///
/// # Panics
///
/// Panics if the status or reason differ.
pub fn assert_run_finished(run: &RunRecord, status: RunStatus, reason: RunReason) {
    assert_eq!(
        run.status, status,
        "Expected run to be {status}, but it was {} ({:?}: {:?})",
        run.status, run.reason, run.reason_message
    );
    assert_eq!(
        run.reason,
        Some(reason),
        "Expected reason {reason}, got {:?} ({:?})",
        run.reason,
        run.reason_message
    );
    assert!(run.end_time.is_some(), "Terminal run has no end time");
}

/// Asserts that sequence ids are `1..=n` in order.
///
/// # Panics
///
/// Panics on a gap, a duplicate or an out-of-order event.
pub fn assert_gap_free(events: &[ControlEvent]) {
    for (expected, event) in (1_u64..).zip(events) {
        assert_eq!(
            event.sequence_id, expected,
            "Expected sequence id {expected}, found {} ({})",
            event.sequence_id, event.event_type
        );
    }
}

/// Number of events of one type.
pub fn count_events(events: &[ControlEvent], event_type: EventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

/// Event types in log order.
pub fn event_types(events: &[ControlEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}
