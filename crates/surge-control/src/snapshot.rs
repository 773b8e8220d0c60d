//! Per-worker metric snapshots.
//!
//! Snapshots are append-only. Counters (`total_ops`, `read_count`,
//! `write_count`, `error_count`) are cumulative for the worker within the
//! phase named on the snapshot, so the latest snapshot of a worker carries
//! that worker's phase totals. `qps` and the latency fields describe only
//! the reporting interval that ended at `timestamp`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::{RunId, WorkerGroupId, WorkerId};

use crate::run::RunPhase;

/// Latency percentiles over one reporting interval, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Median.
    pub p50: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
    /// Mean.
    pub avg: f64,
    /// Fastest observation.
    pub min: f64,
    /// Slowest observation.
    pub max: f64,
}

/// One interval report from one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// Run the worker belongs to.
    pub run_id: RunId,
    /// Reporting worker.
    pub worker_id: WorkerId,
    /// Slot of the reporting worker.
    pub worker_group_id: WorkerGroupId,
    /// End of the reporting interval.
    pub timestamp: DateTime<Utc>,
    /// Phase the worker was in for this interval.
    pub phase: RunPhase,
    /// Operations completed in the phase so far.
    pub total_ops: u64,
    /// Read operations completed in the phase so far.
    pub read_count: u64,
    /// Write operations completed in the phase so far.
    pub write_count: u64,
    /// Failed operations in the phase so far.
    pub error_count: u64,
    /// Throughput over the interval.
    pub qps: f64,
    /// Latency over the interval.
    pub latency: LatencyStats,
    /// Connections open at the end of the interval.
    pub active_connections: u32,
    /// Connections the worker was converging to.
    pub target_connections: u32,
}

impl WorkerSnapshot {
    /// Age of the snapshot at `now` (zero if the clock skewed backwards).
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = WorkerSnapshot {
            run_id: RunId::generate(),
            worker_id: WorkerId::new("w-1"),
            worker_group_id: WorkerGroupId::new(1),
            timestamp: Utc::now(),
            phase: RunPhase::Measurement,
            total_ops: 10,
            read_count: 7,
            write_count: 3,
            error_count: 0,
            qps: 5.0,
            latency: LatencyStats::default(),
            active_connections: 2,
            target_connections: 2,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["phase"], "MEASUREMENT");
        assert_eq!(json["totalOps"], 10);
        assert_eq!(json["workerGroupId"], 1);
    }
}
