//! Worker-count and connection-target allocation.
//!
//! All three load modes share one deterministic remainder allocator:
//! `base = total / n`, `remainder = total % n`, and the slots with the
//! `remainder` lowest group ids get `base + 1`. The same rule distributes a
//! reduction; a slot that would drop below the floor keeps the floor and
//! its shortfall moves to the next slot in ascending group-id order.
//!
//! - [`throughput`]: ramp-and-scale-out toward a throughput target.
//! - [`step`]: capacity discovery by stepping total load.

pub mod step;
pub mod throughput;

use std::collections::BTreeMap;

use surge_core::WorkerGroupId;

use crate::config::{LoadMode, ScenarioConfig};
use crate::error::{Error, Result};

/// Per-slot targets keyed by ascending group id.
pub type GroupTargets = BTreeMap<WorkerGroupId, u32>;

/// Splits `total` across `worker_count` slots with the remainder rule.
///
/// # Errors
///
/// Returns [`Error::ConfigInvalid`] if `worker_count` is zero or `total`
/// cannot give every slot at least `floor`.
pub fn compute_worker_targets(total: u32, worker_count: u32, floor: u32) -> Result<Vec<u32>> {
    if worker_count == 0 {
        return Err(Error::config_invalid("cannot allocate across zero workers"));
    }
    if u64::from(total) < u64::from(floor) * u64::from(worker_count) {
        return Err(Error::config_invalid(format!(
            "{total} connections cannot give {worker_count} workers the floor of {floor}"
        )));
    }

    let base = total / worker_count;
    let remainder = total % worker_count;
    Ok((0..worker_count)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect())
}

/// Keys a target vector by group id `0..n`.
#[must_use]
pub fn by_group(targets: &[u32]) -> GroupTargets {
    targets
        .iter()
        .zip(0_u32..)
        .map(|(target, i)| (WorkerGroupId::new(i), *target))
        .collect()
}

/// Result of distributing a reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDownResult {
    /// New per-slot targets.
    pub targets: GroupTargets,
    /// Part of the requested reduction no slot could absorb.
    pub unabsorbed: u32,
}

/// Distributes a total reduction across slots with the remainder rule.
///
/// Slots never drop below `floor`. Shortfall carries to the next slot in
/// ascending group-id order, wrapping once; whatever is still left is
/// reported as `unabsorbed`.
#[must_use]
pub fn scale_down(current: &GroupTargets, reduction: u32, floor: u32) -> ScaleDownResult {
    let mut targets = current.clone();
    let n = u32::try_from(targets.len()).unwrap_or(u32::MAX);
    if n == 0 || reduction == 0 {
        return ScaleDownResult {
            targets,
            unabsorbed: reduction,
        };
    }

    let base = reduction / n;
    let remainder = reduction % n;
    let mut carry = 0_u32;
    for (i, target) in (0_u32..).zip(targets.values_mut()) {
        let wanted = (if i < remainder { base + 1 } else { base }) + carry;
        let room = target.saturating_sub(floor);
        let taken = wanted.min(room);
        *target -= taken;
        carry = wanted - taken;
    }

    if carry > 0 {
        for target in targets.values_mut() {
            let taken = carry.min(target.saturating_sub(floor));
            *target -= taken;
            carry -= taken;
            if carry == 0 {
                break;
            }
        }
    }

    ScaleDownResult {
        targets,
        unabsorbed: carry,
    }
}

/// Worker count and targets for the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Workers to launch.
    pub worker_count: u32,
    /// Initial per-slot targets.
    pub targets: GroupTargets,
}

/// Computes the initial allocation for a scenario.
///
/// # Errors
///
/// Returns [`Error::ConfigInvalid`] if the bounds cannot be satisfied.
pub fn initial_plan(scenario: &ScenarioConfig) -> Result<AllocationPlan> {
    let floor = scenario.bounds.min_connections_per_worker;
    let worker_count = scenario.initial_worker_count();
    let targets = match &scenario.load {
        LoadMode::ThroughputSeeking { .. } => vec![floor],
        LoadMode::FixedTotal { .. } | LoadMode::FindMax(_) => compute_worker_targets(
            scenario.initial_total_connections(),
            worker_count,
            floor,
        )?,
    };
    Ok(AllocationPlan {
        worker_count,
        targets: by_group(&targets),
    })
}
