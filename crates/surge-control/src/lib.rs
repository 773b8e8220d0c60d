//! # surge-control
//!
//! Control plane for distributed load-generation runs.
//!
//! A run applies a scenario's load with a fleet of independent worker
//! processes. The orchestrator and its workers never talk to each other
//! directly: everything flows through a [`StateStore`](store::StateStore).
//!
//! - **Commands** go out as an append-only, strictly sequenced control-event
//!   log that workers poll and apply in order
//! - **Liveness** comes back as heartbeat rows the orchestrator sweeps
//! - **Measurements** come back as cumulative per-phase snapshots that the
//!   orchestrator merges into fleet-wide aggregates
//!
//! ## Load Modes
//!
//! - **Fixed total**: a constant connection count spread over the fleet
//! - **Throughput seeking**: raise targets, then add workers, until a QPS
//!   target is met
//! - **Find max**: step the connection count up until the target stops
//!   scaling, and report the highest stable step
//!
//! ## Guarantees
//!
//! - Control events of a run carry unique, gap-free sequence numbers
//! - A run's status only moves along the lifecycle graph and its phase
//!   never regresses
//! - A run that reached `RUNNING` is announced to workers with exactly one
//!   `STOP` event when it ends. A run that fails to spawn or register its
//!   fleet ends without any control event
//!
//! ## Example
//!
//! ```rust
//! use surge_control::scaling::{by_group, compute_worker_targets};
//!
//! # fn main() -> surge_control::error::Result<()> {
//! let targets = compute_worker_targets(10, 3, 1)?;
//! assert_eq!(targets, vec![4, 3, 3]);
//! assert_eq!(by_group(&targets).len(), 3);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod guardrail;
pub mod heartbeat;
pub mod metrics;
pub mod orchestrator;
pub mod queue_signal;
pub mod retry;
pub mod run;
pub mod scaling;
pub mod snapshot;
pub mod spawner;
pub mod store;
pub mod worker_contract;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregation::{AggregateMetrics, AggregationPass};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{
        LoadMode, OrchestratorConfig, ScalingBounds, ScenarioConfig, WorkerFailurePolicy,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::{ControlEvent, EventPayload, EventScope, EventType};
    pub use crate::guardrail::{GuardrailConfig, GuardrailMode};
    pub use crate::heartbeat::{HealthThresholds, ResourceUsage, WorkerHeartbeat, WorkerStatus};
    pub use crate::metrics::ControlMetrics;
    pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder};
    pub use crate::queue_signal::{NoQueueSignal, QueueSignal};
    pub use crate::retry::RetryPolicy;
    pub use crate::run::{DrainOutcome, RunPhase, RunReason, RunRecord, RunStatus};
    pub use crate::scaling::step::{FindMaxConfig, StepOutcome, StepRecord};
    pub use crate::snapshot::{LatencyStats, WorkerSnapshot};
    pub use crate::spawner::{SpawnRequest, WorkerSpawner};
    pub use crate::store::memory::InMemoryStateStore;
    pub use crate::store::{CasResult, StateStore};
    pub use crate::worker_contract::{EventCursor, ExitCondition, ExitPolicy};
}

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
