//! Throughput-seeking scale-out.
//!
//! The run starts with one worker at the floor. On each evaluation below
//! the target, workers under the ceiling are raised by `ramp_step`. Once
//! every worker sits at the ceiling and throughput stays below target for
//! [`SCALE_OUT_PATIENCE`] consecutive evaluations, one worker is added at
//! the floor. Existing targets are never reduced here.

use surge_core::WorkerGroupId;

use crate::config::{LoadMode, ScalingBounds, ScenarioConfig, THROUGHPUT_TARGET_FRACTION};
use crate::scaling::GroupTargets;

/// Consecutive below-target evaluations at the ceiling before scale-out.
pub const SCALE_OUT_PATIENCE: u32 = 2;

/// What the throughput seeker wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThroughputDecision {
    /// On target, or waiting for patience.
    Hold,
    /// Raise the listed slots to new absolute targets.
    Raise {
        /// Changed slots only.
        targets: GroupTargets,
    },
    /// Launch one more worker.
    AddWorker {
        /// Slot of the new worker.
        worker_group_id: WorkerGroupId,
        /// Initial target of the new worker.
        target_connections: u32,
    },
    /// Below target with every worker at the ceiling and no room to grow.
    AtCapacity,
}

/// Throughput-seeking controller for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSeeker {
    target_qps: f64,
    ramp_step: u32,
    bounds: ScalingBounds,
}

impl ThroughputSeeker {
    /// Builds a seeker from a scenario, if it is in throughput-seeking mode.
    #[must_use]
    pub fn from_scenario(scenario: &ScenarioConfig) -> Option<Self> {
        match scenario.load {
            LoadMode::ThroughputSeeking {
                target_qps,
                ramp_step,
                ..
            } => Some(Self {
                target_qps,
                ramp_step,
                bounds: scenario.bounds,
            }),
            _ => None,
        }
    }

    /// Throughput below which the target counts as missed.
    #[must_use]
    pub fn threshold_qps(&self) -> f64 {
        self.target_qps * THROUGHPUT_TARGET_FRACTION
    }

    /// Evaluates one fresh aggregate.
    ///
    /// `streak` counts consecutive below-target evaluations with every
    /// worker at the ceiling; it is updated in place.
    pub fn decide(
        &self,
        current_qps: f64,
        targets: &GroupTargets,
        expected_workers: u32,
        streak: &mut u32,
    ) -> ThroughputDecision {
        if current_qps >= self.threshold_qps() {
            *streak = 0;
            return ThroughputDecision::Hold;
        }

        let ceiling = self.bounds.max_connections_per_worker;
        let raised: GroupTargets = targets
            .iter()
            .filter(|(_, target)| **target < ceiling)
            .map(|(group, target)| (*group, target.saturating_add(self.ramp_step).min(ceiling)))
            .collect();
        if !raised.is_empty() {
            *streak = 0;
            return ThroughputDecision::Raise { targets: raised };
        }

        *streak += 1;
        if *streak < SCALE_OUT_PATIENCE {
            return ThroughputDecision::Hold;
        }
        *streak = 0;
        if expected_workers < self.bounds.max_workers {
            ThroughputDecision::AddWorker {
                worker_group_id: WorkerGroupId::new(expected_workers),
                target_connections: self.bounds.min_connections_per_worker,
            }
        } else {
            ThroughputDecision::AtCapacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::by_group;

    fn seeker(max_workers: u32) -> ThroughputSeeker {
        let bounds = ScalingBounds {
            min_connections_per_worker: 2,
            max_connections_per_worker: 8,
            max_workers,
        };
        ThroughputSeeker::from_scenario(&ScenarioConfig::throughput_seeking(1000.0, 4, bounds))
            .unwrap()
    }

    #[test]
    fn on_target_holds() {
        let mut streak = 1;
        let decision = seeker(4).decide(985.0, &by_group(&[8]), 1, &mut streak);
        assert_eq!(decision, ThroughputDecision::Hold);
        assert_eq!(streak, 0);
    }

    #[test]
    fn below_target_raises_to_ceiling() {
        let mut streak = 0;
        let decision = seeker(4).decide(100.0, &by_group(&[2, 6, 8]), 3, &mut streak);
        let mut expected = GroupTargets::new();
        expected.insert(WorkerGroupId::new(0), 6);
        expected.insert(WorkerGroupId::new(1), 8);
        assert_eq!(decision, ThroughputDecision::Raise { targets: expected });
    }

    #[test]
    fn adds_worker_after_two_ticks_at_ceiling() {
        let s = seeker(4);
        let targets = by_group(&[8]);
        let mut streak = 0;
        assert_eq!(s.decide(500.0, &targets, 1, &mut streak), ThroughputDecision::Hold);
        assert_eq!(
            s.decide(500.0, &targets, 1, &mut streak),
            ThroughputDecision::AddWorker {
                worker_group_id: WorkerGroupId::new(1),
                target_connections: 2,
            }
        );
        assert_eq!(streak, 0);
    }

    #[test]
    fn recovery_between_ticks_resets_streak() {
        let s = seeker(4);
        let targets = by_group(&[8]);
        let mut streak = 0;
        s.decide(500.0, &targets, 1, &mut streak);
        s.decide(990.0, &targets, 1, &mut streak);
        assert_eq!(s.decide(500.0, &targets, 1, &mut streak), ThroughputDecision::Hold);
    }

    #[test]
    fn max_workers_caps_scale_out() {
        let s = seeker(1);
        let targets = by_group(&[8]);
        let mut streak = 1;
        assert_eq!(s.decide(500.0, &targets, 1, &mut streak), ThroughputDecision::AtCapacity);
    }

    #[test]
    fn other_modes_have_no_seeker() {
        assert!(ThroughputSeeker::from_scenario(&ScenarioConfig::fixed_total(10, 5)).is_none());
    }
}
