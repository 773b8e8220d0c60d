//! Aggregation of per-worker snapshots into one run rollup.
//!
//! Merge rule, applied to the latest snapshot of each included worker:
//!
//! - counts and throughput are summed;
//! - `p50` is the mean of the per-worker medians;
//! - `p95` and `p99` are the maximum across workers;
//! - `avg` is the throughput-weighted mean; `min`/`max` are the extremes.
//!
//! Taking the worst worker's tail is an approximation. Percentiles cannot
//! be merged exactly without raw samples, and under homogeneous load the
//! result reads roughly 0-20% high, which errs on the safe side for
//! guardrail and stability decisions. Exact post-run percentiles belong to
//! the offline enrichment job.
//!
//! The live pass only admits `MEASUREMENT` snapshots of workers that are
//! not dead. The final pass, run once after the run is terminal, admits
//! every worker that ever reported a measurement snapshot.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::WorkerId;

use crate::heartbeat::{HealthThresholds, WorkerHealth, WorkerHeartbeat};
use crate::run::RunPhase;
use crate::snapshot::{LatencyStats, WorkerSnapshot};

/// Which pass produced an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationPass {
    /// Per-tick view over live measuring workers.
    Live,
    /// Post-terminal view over every worker that reported.
    Final,
}

/// One run-level rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    /// Which pass produced this rollup.
    pub pass: AggregationPass,
    /// When the rollup was computed.
    pub computed_at: DateTime<Utc>,
    /// Timestamp of the newest snapshot that contributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_snapshot_at: Option<DateTime<Utc>>,
    /// Workers that contributed, ascending.
    pub included_workers: Vec<WorkerId>,
    /// Workers that had a snapshot but were left out, ascending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_workers: Vec<WorkerId>,
    /// Sum of operations.
    pub total_ops: u64,
    /// Sum of reads.
    pub read_count: u64,
    /// Sum of writes.
    pub write_count: u64,
    /// Sum of errors.
    pub error_count: u64,
    /// Sum of interval throughput.
    pub qps: f64,
    /// Merged latency (see module docs).
    pub latency: LatencyStats,
    /// Sum of open connections.
    pub active_connections: u64,
    /// Sum of connection targets.
    pub target_connections: u64,
}

impl AggregateMetrics {
    /// An empty rollup.
    #[must_use]
    pub const fn empty(pass: AggregationPass, computed_at: DateTime<Utc>) -> Self {
        Self {
            pass,
            computed_at,
            newest_snapshot_at: None,
            included_workers: Vec::new(),
            excluded_workers: Vec::new(),
            total_ops: 0,
            read_count: 0,
            write_count: 0,
            error_count: 0,
            qps: 0.0,
            latency: LatencyStats {
                p50: 0.0,
                p95: 0.0,
                p99: 0.0,
                avg: 0.0,
                min: 0.0,
                max: 0.0,
            },
            active_connections: 0,
            target_connections: 0,
        }
    }

    /// Number of contributing workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.included_workers.len()
    }

    /// Errors as a percentage of operations (zero when idle).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate_pct(&self) -> f64 {
        if self.total_ops == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_ops as f64 * 100.0
        }
    }
}

/// Merges snapshots with the worst-worker tail rule.
///
/// Callers pass at most one snapshot per worker.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn merge(
    snapshots: &[&WorkerSnapshot],
    pass: AggregationPass,
    computed_at: DateTime<Utc>,
) -> AggregateMetrics {
    let mut out = AggregateMetrics::empty(pass, computed_at);
    if snapshots.is_empty() {
        return out;
    }

    let n = snapshots.len() as f64;
    let mut p50_sum = 0.0;
    let mut weighted_avg = 0.0;
    let mut plain_avg = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for s in snapshots {
        out.total_ops += s.total_ops;
        out.read_count += s.read_count;
        out.write_count += s.write_count;
        out.error_count += s.error_count;
        out.qps += s.qps;
        out.active_connections += u64::from(s.active_connections);
        out.target_connections += u64::from(s.target_connections);

        p50_sum += s.latency.p50;
        out.latency.p95 = out.latency.p95.max(s.latency.p95);
        out.latency.p99 = out.latency.p99.max(s.latency.p99);
        weighted_avg += s.latency.avg * s.qps;
        plain_avg += s.latency.avg;
        min = min.min(s.latency.min);
        max = max.max(s.latency.max);

        out.newest_snapshot_at = out.newest_snapshot_at.max(Some(s.timestamp));
        out.included_workers.push(s.worker_id.clone());
    }

    out.latency.p50 = p50_sum / n;
    out.latency.avg = if out.qps > 0.0 {
        weighted_avg / out.qps
    } else {
        plain_avg / n
    };
    out.latency.min = min;
    out.latency.max = max;
    out.included_workers.sort();
    out
}

/// Live aggregation over the latest snapshot of each worker.
///
/// A worker is left out if its snapshot is not from `MEASUREMENT`, if its
/// heartbeat classifies as dead, or if the snapshot itself is at least
/// `dead_after` old.
#[must_use]
pub fn aggregate_live(
    latest: &[WorkerSnapshot],
    heartbeats: &[WorkerHeartbeat],
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> AggregateMetrics {
    let health: BTreeMap<&WorkerId, WorkerHealth> = heartbeats
        .iter()
        .map(|hb| (&hb.worker_id, thresholds.classify(hb, now)))
        .collect();

    let mut included = Vec::new();
    let mut excluded = BTreeSet::new();
    for snapshot in latest {
        if snapshot.phase != RunPhase::Measurement {
            continue;
        }
        let heartbeat_dead = health
            .get(&snapshot.worker_id)
            .is_some_and(|h| *h == WorkerHealth::Dead);
        if heartbeat_dead || snapshot.age(now) >= thresholds.dead_after {
            excluded.insert(snapshot.worker_id.clone());
        } else {
            included.push(snapshot);
        }
    }

    let mut out = merge(&included, AggregationPass::Live, now);
    out.excluded_workers = excluded.into_iter().collect();
    out
}

/// Final aggregation over every worker that reported in `MEASUREMENT`.
#[must_use]
pub fn aggregate_final(latest: &[WorkerSnapshot], now: DateTime<Utc>) -> AggregateMetrics {
    let included: Vec<&WorkerSnapshot> = latest
        .iter()
        .filter(|s| s.phase == RunPhase::Measurement)
        .collect();
    merge(&included, AggregationPass::Final, now)
}

/// Cheap fingerprint of a latest-snapshot set, used to skip no-op ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotWatermark {
    /// Newest snapshot timestamp in the set.
    pub newest: Option<DateTime<Utc>>,
    /// Number of snapshots in the set.
    pub count: usize,
}

impl SnapshotWatermark {
    /// Fingerprints a latest-snapshot set.
    #[must_use]
    pub fn of(latest: &[WorkerSnapshot]) -> Self {
        Self {
            newest: latest.iter().map(|s| s.timestamp).max(),
            count: latest.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use surge_core::{RunId, WorkerGroupId};

    fn snapshot(i: u32, p50: f64, p95: f64, at: DateTime<Utc>) -> WorkerSnapshot {
        WorkerSnapshot {
            run_id: RunId::generate(),
            worker_id: WorkerId::new(format!("w-{i}")),
            worker_group_id: WorkerGroupId::new(i),
            timestamp: at,
            phase: RunPhase::Measurement,
            total_ops: 100,
            read_count: 80,
            write_count: 20,
            error_count: 1,
            qps: 50.0,
            latency: LatencyStats {
                p50,
                p95,
                p99: p95 + 10.0,
                avg: p50 + 1.0,
                min: 1.0 + f64::from(i),
                max: p95 + 20.0,
            },
            active_connections: 4,
            target_connections: 4,
        }
    }

    #[test]
    fn worst_worker_tail_and_mean_median() {
        let now = Utc::now();
        let p50s = [10.0, 11.0, 9.0, 12.0, 10.0];
        let p95s = [42.0, 45.0, 38.0, 51.0, 44.0];
        let snapshots: Vec<WorkerSnapshot> = (0..5)
            .map(|i| snapshot(i, p50s[i as usize], p95s[i as usize], now))
            .collect();
        let refs: Vec<&WorkerSnapshot> = snapshots.iter().collect();
        let agg = merge(&refs, AggregationPass::Live, now);

        assert!((agg.latency.p95 - 51.0).abs() < f64::EPSILON);
        assert!((agg.latency.p50 - 10.4).abs() < 1e-9);
        assert!((agg.latency.p99 - 61.0).abs() < f64::EPSILON);
        assert_eq!(agg.total_ops, 500);
        assert_eq!(agg.error_count, 5);
        assert!((agg.qps - 250.0).abs() < f64::EPSILON);
        assert!((agg.latency.min - 1.0).abs() < f64::EPSILON);
        assert_eq!(agg.worker_count(), 5);
    }

    #[test]
    fn empty_input_gives_empty_rollup() {
        let agg = merge(&[], AggregationPass::Final, Utc::now());
        assert_eq!(agg.worker_count(), 0);
        assert_eq!(agg.total_ops, 0);
        assert!(agg.newest_snapshot_at.is_none());
    }

    #[test]
    fn live_pass_skips_warmup_and_dead_workers() {
        let now = Utc::now();
        let thresholds = HealthThresholds::default();
        let mut warming = snapshot(0, 10.0, 40.0, now);
        warming.phase = RunPhase::Warmup;
        let fresh = snapshot(1, 10.0, 40.0, now);
        let old = snapshot(2, 10.0, 90.0, now - ChronoDuration::seconds(120));

        let agg = aggregate_live(&[warming, fresh, old], &[], &thresholds, now);
        assert_eq!(agg.included_workers, vec![WorkerId::new("w-1")]);
        assert_eq!(agg.excluded_workers, vec![WorkerId::new("w-2")]);
        assert!((agg.latency.p95 - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_pass_respects_heartbeat_health() {
        let now = Utc::now();
        let thresholds = HealthThresholds::default();
        let snap = snapshot(0, 10.0, 40.0, now);
        let mut hb = WorkerHeartbeat::registered(
            snap.run_id,
            snap.worker_id.clone(),
            snap.worker_group_id,
            now - ChronoDuration::seconds(61),
        );
        hb.status = crate::heartbeat::WorkerStatus::Running;

        let agg = aggregate_live(&[snap], &[hb], &thresholds, now);
        assert_eq!(agg.worker_count(), 0);
        assert_eq!(agg.excluded_workers.len(), 1);
    }

    #[test]
    fn final_pass_includes_dead_workers() {
        let now = Utc::now();
        let old = snapshot(2, 10.0, 90.0, now - ChronoDuration::seconds(600));
        let agg = aggregate_final(&[old], now);
        assert_eq!(agg.worker_count(), 1);
        assert_eq!(agg.pass, AggregationPass::Final);
    }

    #[test]
    fn watermark_changes_with_new_snapshots() {
        let now = Utc::now();
        let a = SnapshotWatermark::of(&[snapshot(0, 1.0, 2.0, now)]);
        let b = SnapshotWatermark::of(&[snapshot(0, 1.0, 2.0, now + ChronoDuration::seconds(1))]);
        assert_ne!(a, b);
        assert_eq!(SnapshotWatermark::of(&[]), SnapshotWatermark::default());
    }

    #[test]
    fn error_rate_is_percent() {
        let mut agg = AggregateMetrics::empty(AggregationPass::Live, Utc::now());
        assert!(agg.error_rate_pct().abs() < f64::EPSILON);
        agg.total_ops = 200;
        agg.error_count = 3;
        assert!((agg.error_rate_pct() - 1.5).abs() < 1e-9);
    }
}
