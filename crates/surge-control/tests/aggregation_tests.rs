//! Live and final aggregation as seen through the orchestrator.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use surge_control::aggregation::AggregationPass;
use surge_control::config::ScenarioConfig;
use surge_control::error::Result;
use surge_control::run::{DrainOutcome, RunPhase, RunReason, RunStatus};
use surge_core::WorkerGroupId;
use surge_test_utils::{TestHarness, WorkerReport, assert_run_finished, worker_id_for};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

async fn measuring(h: &TestHarness) -> Result<surge_core::RunId> {
    let scenario = ScenarioConfig::fixed_total(4, 2).with_timings(secs(1), secs(100), Duration::ZERO);
    let (run_id, _) = h.launch(scenario).await?;
    let run = h.step(&run_id, secs(2)).await?;
    assert_eq!(run.phase, RunPhase::Measurement);
    h.step(&run_id, secs(1)).await?;
    Ok(run_id)
}

#[tokio::test]
async fn dead_worker_leaves_live_view_but_counts_in_final() -> Result<()> {
    let h = TestHarness::new();
    let run_id = measuring(&h).await?;

    let run = h.report_and_step(&run_id, secs(1), 200.0, 10.0).await?;
    let live = run.latest_aggregate.clone().unwrap();
    assert_eq!(live.worker_count(), 2);
    assert!((live.qps - 200.0).abs() < 1e-9);

    let lost = worker_id_for(WorkerGroupId::new(1));
    h.fleet.silence(&lost).await;
    let run = h.report_and_step(&run_id, secs(61), 100.0, 10.0).await?;
    assert_eq!(run.status, RunStatus::Running);
    let live = run.latest_aggregate.clone().unwrap();
    assert_eq!(live.pass, AggregationPass::Live);
    assert_eq!(live.included_workers, vec![worker_id_for(WorkerGroupId::new(0))]);
    assert_eq!(live.excluded_workers, vec![lost]);
    assert!((live.qps - 100.0).abs() < 1e-9);
    assert_eq!(run.total_ops, 200);

    h.orchestrator.stop_run(&run_id, "done").await?;
    let run = h.step(&run_id, secs(1)).await?;
    assert_run_finished(&run, RunStatus::Cancelled, RunReason::UserCancelled);
    assert_eq!(run.drain_outcome, Some(DrainOutcome::Graceful));

    let last = run.latest_aggregate.clone().unwrap();
    assert_eq!(last.pass, AggregationPass::Final);
    assert_eq!(last.worker_count(), 2);
    assert_eq!(last.total_ops, 300);
    assert_eq!(run.total_ops, 300);
    Ok(())
}

#[tokio::test]
async fn warmup_traffic_is_not_measured() -> Result<()> {
    let h = TestHarness::new();
    let scenario = ScenarioConfig::fixed_total(4, 2).with_timings(secs(5), secs(100), Duration::ZERO);
    let (run_id, _) = h.launch(scenario).await?;

    let run = h.report_and_step(&run_id, secs(1), 500.0, 10.0).await?;
    assert_eq!(run.phase, RunPhase::Warmup);
    assert_eq!(run.total_ops, 0);
    assert_eq!(
        run.latest_aggregate.as_ref().map_or(0, |a| a.worker_count()),
        0
    );

    h.step(&run_id, secs(5)).await?;
    h.step(&run_id, secs(1)).await?;
    let run = h.report_and_step(&run_id, secs(1), 40.0, 10.0).await?;
    assert_eq!(run.total_ops, 40);
    Ok(())
}

#[tokio::test]
async fn errors_roll_up_onto_the_run() -> Result<()> {
    let h = TestHarness::new();
    let run_id = measuring(&h).await?;

    h.fleet
        .report(&worker_id_for(WorkerGroupId::new(0)), WorkerReport::new(50.0, 8.0).with_errors(3))
        .await?;
    h.fleet
        .report(&worker_id_for(WorkerGroupId::new(1)), WorkerReport::new(30.0, 12.0))
        .await?;
    let run = h.step(&run_id, secs(1)).await?;

    assert_eq!(run.total_ops, 80);
    assert_eq!(run.error_count, 3);
    let live = run.latest_aggregate.clone().unwrap();
    assert!((live.latency.p95 - 12.0).abs() < 1e-9);
    Ok(())
}
