//! Property-based tests for control-plane invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tokio_test::block_on;

use surge_control::config::ScenarioConfig;
use surge_control::events::{EventDraft, EventPayload, EventScope};
use surge_control::run::{RunPhase, RunRecord, RunStatus};
use surge_control::scaling::compute_worker_targets;
use surge_control::store::StateStore;
use surge_control::store::memory::InMemoryStateStore;
use surge_core::RunId;

fn fresh_run() -> RunRecord {
    let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    RunRecord::new(RunId::generate(), ScenarioConfig::fixed_total(4, 2), created)
}

fn arb_status() -> impl Strategy<Value = RunStatus> {
    prop::sample::select(RunStatus::ALL.to_vec())
}

fn arb_phase() -> impl Strategy<Value = RunPhase> {
    prop::sample::select(RunPhase::ALL.to_vec())
}

proptest! {
    /// Applied transitions follow the status graph and terminal runs never move.
    #[test]
    fn status_changes_follow_the_graph(targets in prop::collection::vec(arb_status(), 1..12)) {
        let mut run = fresh_run();
        let now = run.created_at;
        for target in targets {
            let before = run.status;
            let applied = run.transition_to(target, now).is_ok();
            prop_assert_eq!(applied, before.can_transition_to(target));
            if before.is_terminal() {
                prop_assert!(!applied);
                prop_assert_eq!(run.status, before);
            }
            if applied {
                prop_assert_eq!(run.status, target);
            }
        }
    }

    /// The phase only ever moves forward.
    #[test]
    fn phase_never_regresses(targets in prop::collection::vec(arb_phase(), 1..12)) {
        let mut run = fresh_run();
        let now = run.created_at;
        for target in targets {
            let before = run.phase;
            match run.advance_phase(target, now) {
                Ok(()) => prop_assert!(run.phase > before),
                Err(_) => prop_assert_eq!(run.phase, before),
            }
        }
    }

    /// Allocation conserves the total, is balanced and respects the floor.
    #[test]
    fn allocation_is_balanced(
        worker_count in 1u32..64,
        floor in 0u32..8,
        extra in 0u32..500,
    ) {
        let total = worker_count * floor + extra;
        let targets = compute_worker_targets(total, worker_count, floor).unwrap();

        prop_assert_eq!(targets.len(), worker_count as usize);
        prop_assert_eq!(targets.iter().sum::<u32>(), total);
        let max = *targets.iter().max().unwrap();
        let min = *targets.iter().min().unwrap();
        prop_assert!(max - min <= 1);
        prop_assert!(min >= floor);
        prop_assert!(targets.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    /// Allocation below the floor is rejected.
    #[test]
    fn allocation_below_floor_is_rejected(worker_count in 1u32..32, floor in 1u32..8) {
        let total = worker_count * floor - 1;
        prop_assert!(compute_worker_targets(total, worker_count, floor).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Concurrent appenders get unique, gap-free sequence ids.
    #[test]
    fn sequence_ids_are_unique_under_concurrency(writers in 1usize..8, appends in 1usize..16) {
        let store = Arc::new(InMemoryStateStore::new());
        let run = fresh_run();
        let run_id = run.run_id;
        block_on(store.create_run(&run)).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let ids: Vec<u64> = runtime.block_on(async {
            let mut handles = Vec::new();
            for _ in 0..writers {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    let mut ids = Vec::new();
                    for _ in 0..appends {
                        let draft = EventDraft::new(
                            EventScope::Run,
                            EventPayload::SetPhase { phase: RunPhase::Measurement },
                            Utc::now(),
                        );
                        ids.push(store.append_event(&run_id, draft).await.unwrap().sequence_id);
                    }
                    ids
                }));
            }
            let mut all = Vec::new();
            for handle in handles {
                all.extend(handle.await.unwrap());
            }
            all
        });

        let total = (writers * appends) as u64;
        let unique: BTreeSet<u64> = ids.iter().copied().collect();
        prop_assert_eq!(unique.len(), ids.len());
        prop_assert_eq!(unique, (1..=total).collect::<BTreeSet<u64>>());

        let polled = block_on(store.poll_events_since(&run_id, 0)).unwrap();
        let sequence: Vec<u64> = polled.iter().map(|e| e.sequence_id).collect();
        prop_assert_eq!(sequence, (1..=total).collect::<Vec<u64>>());
    }
}
