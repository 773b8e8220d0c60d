//! Error types for the control plane.
//!
//! Run-level failure causes (worker death, resource exhaustion, registration
//! timeout) are not errors in this sense: they are recorded on the
//! [`RunRecord`](crate::run::RunRecord) as a [`RunReason`](crate::run::RunReason).
//! The variants here are returned to callers of the orchestrator and the
//! store.

use surge_core::{RunId, WorkerId};

/// The result type used throughout surge-control.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The scenario configuration failed static validation.
    #[error("invalid scenario config: {message}")]
    ConfigInvalid {
        /// Which rule the config violated.
        message: String,
    },

    /// Process-level configuration could not be loaded.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// A run with this ID already exists.
    #[error("run already exists: {run_id}")]
    RunAlreadyExists {
        /// The duplicate run ID.
        run_id: RunId,
    },

    /// A step record for this run and step number already exists.
    #[error("step {step_number} of run {run_id} already recorded")]
    StepAlreadyRecorded {
        /// The run ID.
        run_id: RunId,
        /// The step number that was already written.
        step_number: u32,
    },

    /// No heartbeat exists for the worker.
    #[error("worker {worker_id} has no heartbeat in run {run_id}")]
    WorkerNotFound {
        /// The run ID.
        run_id: RunId,
        /// The worker that was looked up.
        worker_id: WorkerId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A store call failed momentarily and may succeed on retry.
    #[error("transient store error: {message}")]
    TransientStore {
        /// Description of the failure.
        message: String,
    },

    /// A store call failed in a way that retrying will not fix.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The worker spawner could not launch a worker.
    #[error("spawn failed: {message}")]
    Spawn {
        /// Description of the spawn failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from surge-core.
    #[error("core error: {0}")]
    Core(#[from] surge_core::Error),
}

impl Error {
    /// Creates a config validation error.
    #[must_use]
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates a process configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a transient store error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "COMPLETED".into(),
            to: "RUNNING".into(),
            reason: "terminal status".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("RUNNING"));
        assert!(msg.contains("terminal status"));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::transient("connection reset").is_transient());
        assert!(!Error::storage("constraint violated").is_transient());
        assert!(!Error::config_invalid("bad bounds").is_transient());
    }

    #[test]
    fn json_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.to_string().starts_with("serialization error"));
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = surge_core::Error::InvalidInput("empty".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }
}
