//! Worker launch contract.
//!
//! The orchestrator only ever asks for "one worker in this slot". How the
//! worker is launched (process, container, job) is the spawner's business.
//! A launched worker registers itself by upserting its first heartbeat.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use surge_core::{RunId, WorkerGroupId};

use crate::error::Result;

/// Identifiers handed to a newly launched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    /// Run the worker joins.
    pub run_id: RunId,
    /// Slot of the worker, `0..worker_group_count`.
    pub worker_group_id: WorkerGroupId,
    /// Fleet size at launch time.
    pub worker_group_count: u32,
}

impl SpawnRequest {
    /// Requests for a whole fleet of `count` workers, slots `0..count`.
    #[must_use]
    pub fn fleet(run_id: RunId, count: u32) -> Vec<Self> {
        (0..count)
            .map(|i| Self {
                run_id,
                worker_group_id: WorkerGroupId::new(i),
                worker_group_count: count,
            })
            .collect()
    }
}

/// Launches workers.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + Debug {
    /// Launches one worker.
    ///
    /// Returning `Ok` means the launch was accepted, not that the worker has
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`](crate::error::Error::Spawn) if the launch
    /// was rejected.
    async fn spawn(&self, request: SpawnRequest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_requests_are_deterministic() {
        let run_id = RunId::generate();
        let requests = SpawnRequest::fleet(run_id, 3);
        assert_eq!(requests.len(), 3);
        for (i, request) in (0_u32..).zip(&requests) {
            assert_eq!(request.worker_group_id, WorkerGroupId::new(i));
            assert_eq!(request.worker_group_count, 3);
            assert_eq!(request.run_id, run_id);
        }
    }
}
