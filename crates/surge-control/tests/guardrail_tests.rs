//! Resource guardrail tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use surge_control::config::{ScalingBounds, ScenarioConfig};
use surge_control::error::Result;
use surge_control::events::{EventPayload, EventScope, EventType};
use surge_control::guardrail::{GuardrailConfig, GuardrailMode};
use surge_control::run::{RunReason, RunStatus};
use surge_core::WorkerGroupId;
use surge_test_utils::{
    TestHarness, assert_gap_free, assert_run_finished, count_events, usage, worker_id_for,
};

const SEC: Duration = Duration::from_secs(1);

fn guarded(mode: GuardrailMode) -> ScenarioConfig {
    ScenarioConfig::fixed_total(30, 10).with_guardrails(GuardrailConfig {
        mode,
        ..GuardrailConfig::default()
    })
}

#[tokio::test]
async fn partial_breach_backs_off_and_scales_out() -> Result<()> {
    let h = TestHarness::new();
    let (run_id, run) = h.launch(guarded(GuardrailMode::Soft)).await?;
    assert_eq!(run.expected_workers, 3);

    let hot = worker_id_for(WorkerGroupId::new(1));
    h.fleet.set_resources(&hot, usage(95.0, 40.0)).await;
    let run = h.step(&run_id, SEC).await?;

    assert_eq!(run.status, RunStatus::Running);
    assert!(!run.degraded);
    assert_eq!(run.expected_workers, 4);
    let targets: Vec<u32> = run.group_targets.values().copied().collect();
    assert_eq!(targets, vec![10, 7, 10, 1]);
    assert_eq!(h.fleet.spawned().len(), 4);

    let events = h.events(&run_id).await?;
    assert_gap_free(&events);
    let scale_downs: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::ScaleDown)
        .collect();
    assert_eq!(scale_downs.len(), 1);
    assert_eq!(scale_downs[0].scope, EventScope::Worker(hot.clone()));
    assert!(matches!(
        &scale_downs[0].payload,
        EventPayload::ScaleDown { target_connections: 7, reason } if reason.contains("cpu")
    ));
    let last = events.last().unwrap();
    assert_eq!(last.scope, EventScope::WorkerGroup(WorkerGroupId::new(3)));
    assert_eq!(last.payload.target_connections(), Some(1));

    // The breached worker applies its new target on the next poll.
    h.fleet.set_resources(&hot, usage(50.0, 40.0)).await;
    h.step(&run_id, SEC).await?;
    assert_eq!(h.fleet.heartbeat(&hot).await.unwrap().target_connections, 7);
    Ok(())
}

#[tokio::test]
async fn back_off_without_room_to_scale_out_is_degraded() -> Result<()> {
    let h = TestHarness::new();
    let bounds = ScalingBounds {
        min_connections_per_worker: 1,
        max_connections_per_worker: 10,
        max_workers: 3,
    };
    let (run_id, _) = h
        .launch(guarded(GuardrailMode::Soft).with_bounds(bounds))
        .await?;

    h.fleet
        .set_resources(&worker_id_for(WorkerGroupId::new(0)), usage(20.0, 97.0))
        .await;
    let run = h.step(&run_id, SEC).await?;

    assert_eq!(run.status, RunStatus::Running);
    assert!(run.degraded);
    assert_eq!(run.expected_workers, 3);
    let targets: Vec<u32> = run.group_targets.values().copied().collect();
    assert_eq!(targets, vec![7, 10, 10]);
    assert_eq!(h.fleet.spawned().len(), 3);
    Ok(())
}

#[tokio::test]
async fn breach_with_every_offender_at_the_floor_is_degraded() -> Result<()> {
    let h = TestHarness::new();
    let bounds = ScalingBounds {
        min_connections_per_worker: 10,
        max_connections_per_worker: 10,
        max_workers: 5,
    };
    let (run_id, _) = h
        .launch(guarded(GuardrailMode::Soft).with_bounds(bounds))
        .await?;

    h.fleet
        .set_resources(&worker_id_for(WorkerGroupId::new(1)), usage(96.0, 20.0))
        .await;
    let run = h.step(&run_id, SEC).await?;

    assert_eq!(run.status, RunStatus::Running);
    assert!(run.degraded);
    let targets: Vec<u32> = run.group_targets.values().copied().collect();
    assert_eq!(targets, vec![10, 10, 10]);
    assert_eq!(h.fleet.spawned().len(), 3);
    let events = h.events(&run_id).await?;
    assert_eq!(count_events(&events, EventType::ScaleDown), 0);
    assert_eq!(count_events(&events, EventType::GuardrailWarning), 0);

    // The record keeps the degraded flag after the worker cools down.
    h.fleet
        .set_resources(&worker_id_for(WorkerGroupId::new(1)), usage(40.0, 20.0))
        .await;
    let run = h.step(&run_id, SEC).await?;
    assert!(run.degraded);
    Ok(())
}

#[tokio::test]
async fn refused_scale_out_is_degraded() -> Result<()> {
    let h = TestHarness::new();
    let (run_id, _) = h.launch(guarded(GuardrailMode::Soft)).await?;

    h.fleet.set_fail_spawns(true);
    h.fleet
        .set_resources(&worker_id_for(WorkerGroupId::new(2)), usage(99.0, 99.0))
        .await;
    let run = h.step(&run_id, SEC).await?;

    assert!(run.degraded);
    assert_eq!(run.expected_workers, 3);
    assert!(!run.group_targets.contains_key(&WorkerGroupId::new(3)));
    Ok(())
}

#[tokio::test]
async fn sustained_fleet_wide_breach_fails_the_run() -> Result<()> {
    let h = TestHarness::new();
    let (run_id, _) = h.launch(guarded(GuardrailMode::Soft)).await?;

    h.fleet.set_all_resources(usage(95.0, 95.0)).await;
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);

    let run = h.step(&run_id, SEC).await?;
    assert_run_finished(&run, RunStatus::Failed, RunReason::ResourceExhaustion);

    let events = h.events(&run_id).await?;
    assert_eq!(count_events(&events, EventType::GuardrailWarning), 2);
    assert_eq!(count_events(&events, EventType::ScaleDown), 0);
    assert_eq!(count_events(&events, EventType::Stop), 1);
    Ok(())
}

#[tokio::test]
async fn fleet_wide_streak_resets_when_a_worker_recovers() -> Result<()> {
    let h = TestHarness::new();
    let (run_id, _) = h.launch(guarded(GuardrailMode::Soft)).await?;

    h.fleet.set_all_resources(usage(95.0, 95.0)).await;
    h.step(&run_id, SEC).await?;
    h.step(&run_id, SEC).await?;

    h.fleet.set_all_resources(usage(10.0, 10.0)).await;
    h.step(&run_id, SEC).await?;

    h.fleet.set_all_resources(usage(95.0, 95.0)).await;
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(
        count_events(&h.events(&run_id).await?, EventType::GuardrailWarning),
        3
    );
    Ok(())
}

#[tokio::test]
async fn hard_mode_fails_on_first_breach() -> Result<()> {
    let h = TestHarness::new();
    let (run_id, _) = h.launch(guarded(GuardrailMode::Hard)).await?;

    h.fleet
        .set_resources(&worker_id_for(WorkerGroupId::new(1)), usage(91.0, 10.0))
        .await;
    let run = h.step(&run_id, SEC).await?;

    assert_run_finished(&run, RunStatus::Failed, RunReason::ResourceExhaustion);
    assert!(run.reason_message.as_deref().unwrap().contains("worker-1"));
    assert_eq!(h.fleet.spawned().len(), 3);
    Ok(())
}
