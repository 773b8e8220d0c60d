//! Worker heartbeats and read-time health classification.
//!
//! A heartbeat row is upserted in place by its worker. Health is never
//! stored on the row: it is derived from `now - last_heartbeat` every time
//! the row is read, so a reader can never observe a stale `HEALTHY` label
//! written before the worker stopped reporting.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use surge_core::{RunId, WorkerGroupId, WorkerId};

use crate::run::RunPhase;

/// Status a worker reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Process launched, connecting to the target.
    Starting,
    /// Registered, waiting for `START`.
    Waiting,
    /// Applying load.
    Running,
    /// Stopped admitting work, finishing in-flight work.
    Draining,
    /// Exited cleanly.
    Completed,
    /// Declared dead by the orchestrator's staleness sweep.
    Dead,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Draining => "DRAINING",
            Self::Completed => "COMPLETED",
            Self::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// Resource telemetry attached to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Process CPU utilisation, percent of the worker's allotment.
    pub cpu_pct: f64,
    /// Resident memory, percent of the worker's allotment.
    pub memory_pct: f64,
}

/// Liveness record for one worker of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
    /// Run the worker belongs to.
    pub run_id: RunId,
    /// Worker identity.
    pub worker_id: WorkerId,
    /// Slot assigned at spawn time.
    pub worker_group_id: WorkerGroupId,
    /// Self-reported status.
    pub status: WorkerStatus,
    /// Phase the worker believes the run is in.
    pub phase: RunPhase,
    /// When the worker last wrote this row.
    pub last_heartbeat: DateTime<Utc>,
    /// Connections currently open.
    pub active_connections: u32,
    /// Connections the worker is converging to.
    pub target_connections: u32,
    /// Most recent error the worker saw, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Resource telemetry, if the worker reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
}

impl WorkerHeartbeat {
    /// Creates a heartbeat for a worker that has just registered.
    #[must_use]
    pub fn registered(
        run_id: RunId,
        worker_id: WorkerId,
        worker_group_id: WorkerGroupId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            worker_id,
            worker_group_id,
            status: WorkerStatus::Waiting,
            phase: RunPhase::Preparing,
            last_heartbeat: now,
            active_connections: 0,
            target_connections: 0,
            last_error: None,
            resources: None,
        }
    }

    /// Age of the heartbeat at `now` (zero if the clock skewed backwards).
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

/// Health derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    /// Heartbeat is fresh.
    Healthy,
    /// Heartbeat is late but the worker is not yet presumed dead.
    Stale,
    /// Heartbeat is too old, or the worker was already marked dead.
    Dead,
}

impl WorkerHealth {
    /// Returns true if the worker may contribute to live aggregation.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Healthy | Self::Stale)
    }
}

/// Age thresholds for health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Age after which a heartbeat is stale.
    pub stale_after: Duration,
    /// Age after which a worker is presumed dead.
    pub dead_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(60),
        }
    }
}

impl HealthThresholds {
    /// Classifies a heartbeat at `now`.
    ///
    /// A worker that reported `COMPLETED` is healthy regardless of age: it
    /// stopped heartbeating because it exited cleanly.
    #[must_use]
    pub fn classify(&self, heartbeat: &WorkerHeartbeat, now: DateTime<Utc>) -> WorkerHealth {
        match heartbeat.status {
            WorkerStatus::Dead => WorkerHealth::Dead,
            WorkerStatus::Completed => WorkerHealth::Healthy,
            _ => self.classify_age(heartbeat.age(now)),
        }
    }

    /// Classifies a bare age.
    #[must_use]
    pub fn classify_age(&self, age: Duration) -> WorkerHealth {
        if age >= self.dead_after {
            WorkerHealth::Dead
        } else if age >= self.stale_after {
            WorkerHealth::Stale
        } else {
            WorkerHealth::Healthy
        }
    }
}

/// A heartbeat paired with its health at sweep time.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedWorker {
    /// The heartbeat as read from the store.
    pub heartbeat: WorkerHeartbeat,
    /// Health at the sweep's `now`.
    pub health: WorkerHealth,
}

/// Classifies every heartbeat of a run at a single instant.
#[must_use]
pub fn classify_all(
    thresholds: &HealthThresholds,
    heartbeats: Vec<WorkerHeartbeat>,
    now: DateTime<Utc>,
) -> Vec<ClassifiedWorker> {
    heartbeats
        .into_iter()
        .map(|heartbeat| {
            let health = thresholds.classify(&heartbeat, now);
            ClassifiedWorker { heartbeat, health }
        })
        .collect()
}
