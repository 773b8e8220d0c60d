//! External queueing signal for capacity discovery.
//!
//! Some targets expose server-side queueing (admission queues, connection
//! pool waits) that shows saturation before latency does. The step
//! controller stops when this signal fires.

use std::fmt::Debug;

use async_trait::async_trait;

use surge_core::RunId;

use crate::error::Result;

/// Source of the external queueing signal.
#[async_trait]
pub trait QueueSignal: Send + Sync + Debug {
    /// Returns true if the target showed queueing since the last call.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be read; the orchestrator
    /// treats that as "no signal" for the current evaluation.
    async fn queue_detected(&self, run_id: &RunId) -> Result<bool>;
}

/// Signal source for targets without a queueing signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQueueSignal;

#[async_trait]
impl QueueSignal for NoQueueSignal {
    async fn queue_detected(&self, _run_id: &RunId) -> Result<bool> {
        Ok(false)
    }
}
