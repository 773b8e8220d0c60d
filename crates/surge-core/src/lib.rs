//! # surge-core
//!
//! Core primitives shared by the surge load-orchestration crates.
//!
//! - **Identifiers**: Strongly-typed IDs for runs, control events and workers
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialisation and span constructors
//!
//! ## Crate Boundary
//!
//! `surge-core` holds only the types that cross crate boundaries. Domain
//! logic for the control plane lives in `surge-control`.
//!
//! ## Example
//!
//! ```rust
//! use surge_core::prelude::*;
//!
//! let run_id = RunId::generate();
//! let worker = WorkerId::new("worker-0");
//! let group = WorkerGroupId::new(0);
//! assert_eq!(worker.as_str(), "worker-0");
//! assert_eq!(group.get(), 0);
//! assert!(!run_id.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventId, RunId, WorkerGroupId, WorkerId};
    pub use crate::observability::{LogFormat, init_logging};
}

pub use error::{Error, Result};
pub use id::{EventId, RunId, WorkerGroupId, WorkerId};
pub use observability::{LogFormat, init_logging};
