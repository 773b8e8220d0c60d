//! Store fault handling: retried calls, failed ticks and recovery.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use surge_control::config::ScenarioConfig;
use surge_control::error::Result;
use surge_control::events::EventType;
use surge_control::heartbeat::WorkerStatus;
use surge_control::run::{RunPhase, RunReason, RunStatus};
use surge_test_utils::{
    FaultConfig, TestHarness, assert_gap_free, assert_run_finished, count_events, test_config,
};

const SEC: Duration = Duration::from_secs(1);

#[tokio::test]
async fn transient_faults_are_retried_within_a_tick() -> Result<()> {
    let (h, faulty) = TestHarness::with_faults(test_config(), FaultConfig::no_faults());
    let (run_id, _) = h.launch(ScenarioConfig::fixed_total(4, 2)).await?;

    faulty.fail_next(2);
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(faulty.injected_faults(), 2);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_fail_only_the_tick() -> Result<()> {
    let (h, faulty) = TestHarness::with_faults(test_config(), FaultConfig::no_faults());
    let (run_id, before) = h.launch(ScenarioConfig::fixed_total(4, 2)).await?;

    faulty.fail_operation("update_run");
    h.clock.advance(SEC);
    h.fleet.sync().await?;
    let err = h.orchestrator.tick(&run_id).await.unwrap_err();
    assert!(err.is_transient());

    let stored = h.orchestrator.get_run(&run_id).await?;
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.updated_at, before.updated_at);

    faulty.clear_failures();
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.updated_at > before.updated_at);
    Ok(())
}

#[tokio::test]
async fn interrupted_start_is_announced_by_the_next_tick() -> Result<()> {
    let (h, faulty) = TestHarness::with_faults(test_config(), FaultConfig::no_faults());
    let run_id = h
        .orchestrator
        .create_run(ScenarioConfig::fixed_total(4, 2))
        .await?;

    faulty.fail_operation("append_event");
    assert!(h.orchestrator.start_run(&run_id).await.is_err());
    let stored = h.orchestrator.get_run(&run_id).await?;
    assert_eq!(stored.status, RunStatus::Running);
    assert!(!stored.start_announced);
    assert!(h.events(&run_id).await?.is_empty());

    faulty.clear_failures();
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.start_announced);
    let events = h.events(&run_id).await?;
    assert_gap_free(&events);
    assert_eq!(count_events(&events, EventType::Start), 1);
    assert_eq!(count_events(&events, EventType::SetWorkerTarget), 2);

    // Workers pick the run up from the repaired log.
    let run = h.step(&run_id, SEC).await?;
    assert_eq!(run.phase, RunPhase::Warmup);
    let events = h.events(&run_id).await?;
    assert_eq!(count_events(&events, EventType::Start), 1);
    assert_eq!(count_events(&events, EventType::SetWorkerTarget), 2);
    for worker_id in h.fleet.worker_ids().await {
        let hb = h.fleet.heartbeat(&worker_id).await.unwrap();
        assert_eq!(hb.status, WorkerStatus::Running);
        assert_eq!(hb.target_connections, 2);
    }
    Ok(())
}

#[tokio::test]
async fn interrupted_start_keeps_its_poll_loop() -> Result<()> {
    let mut config = test_config();
    config.autostart_poll_loop = true;
    config.poll_interval = Duration::from_millis(5);
    let (h, faulty) = TestHarness::with_faults(config, FaultConfig::no_faults());
    let run_id = h
        .orchestrator
        .create_run(ScenarioConfig::fixed_total(4, 2))
        .await?;

    faulty.fail_operation("append_event");
    assert!(h.orchestrator.start_run(&run_id).await.is_err());
    assert_eq!(h.orchestrator.active_poll_loops(), 1);
    faulty.clear_failures();

    let mut announced = false;
    for _ in 0..200 {
        if h.orchestrator.get_run(&run_id).await?.start_announced {
            announced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.orchestrator.shutdown();
    assert!(announced);
    assert_eq!(count_events(&h.events(&run_id).await?, EventType::Start), 1);
    Ok(())
}

#[tokio::test]
async fn failed_stop_can_be_repeated_without_duplicate_events() -> Result<()> {
    let (h, faulty) = TestHarness::with_faults(test_config(), FaultConfig::no_faults());
    let (run_id, _) = h.launch(ScenarioConfig::fixed_total(4, 2)).await?;

    faulty.fail_operation("append_event");
    assert!(h.orchestrator.stop_run(&run_id, "first try").await.is_err());
    assert_eq!(h.orchestrator.get_run(&run_id).await?.status, RunStatus::Running);
    faulty.clear_failures();

    let run = h.orchestrator.stop_run(&run_id, "second try").await?;
    assert_eq!(run.status, RunStatus::Cancelling);
    let events = h.events(&run_id).await?;
    assert_gap_free(&events);
    assert_eq!(count_events(&events, EventType::Stop), 1);
    Ok(())
}

#[tokio::test]
async fn stop_whose_save_failed_is_not_announced_twice() -> Result<()> {
    let (h, faulty) = TestHarness::with_faults(test_config(), FaultConfig::no_faults());
    let (run_id, _) = h.launch(ScenarioConfig::fixed_total(4, 2)).await?;

    faulty.fail_operation("update_run");
    assert!(h.orchestrator.stop_run(&run_id, "first try").await.is_err());
    assert_eq!(count_events(&h.events(&run_id).await?, EventType::Stop), 1);
    faulty.clear_failures();

    let run = h.orchestrator.stop_run(&run_id, "second try").await?;
    assert_eq!(run.status, RunStatus::Cancelling);
    let run = h.step(&run_id, SEC).await?;
    assert_run_finished(&run, RunStatus::Cancelled, RunReason::UserCancelled);
    let events = h.events(&run_id).await?;
    assert_gap_free(&events);
    assert_eq!(count_events(&events, EventType::Stop), 1);
    Ok(())
}

#[tokio::test]
async fn flaky_store_still_runs_to_completion() -> Result<()> {
    let mut config = test_config();
    config.retry.max_attempts = 12;
    let (h, faulty) = TestHarness::with_faults(config, FaultConfig::flaky(0.3, 7));
    let scenario =
        ScenarioConfig::fixed_total(4, 2).with_timings(SEC * 2, SEC * 5, Duration::ZERO);
    let (run_id, _) = h.launch(scenario).await?;

    let mut run = h.orchestrator.get_run(&run_id).await?;
    for _ in 0..20 {
        if run.is_terminal() {
            break;
        }
        run = h.report_and_step(&run_id, SEC, 20.0, 4.0).await?;
    }

    assert_run_finished(&run, RunStatus::Completed, RunReason::Completed);
    assert!(faulty.injected_faults() > 0);
    let events = h.events(&run_id).await?;
    assert_gap_free(&events);
    assert_eq!(count_events(&events, EventType::SetPhase), 3);
    assert_eq!(count_events(&events, EventType::Stop), 1);
    Ok(())
}
