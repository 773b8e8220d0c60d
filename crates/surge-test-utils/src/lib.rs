//! Shared test utilities for surge integration tests.
//!
//! This crate provides:
//! - [`SimulatedClock`]: Manually advanced time for the orchestrator and fleet
//! - [`FaultInjectingStore`]: A store wrapper that fails calls on demand
//! - [`SimulatedFleet`]: An in-process fleet that follows the control protocol
//! - [`TestHarness`]: Pre-wired store, clock, fleet and orchestrator
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use surge_control::config::ScenarioConfig;
//! use surge_test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_example() -> surge_control::Result<()> {
//!     let h = TestHarness::new();
//!     let (run_id, _) = h.launch(ScenarioConfig::fixed_total(6, 3)).await?;
//!     let run = h.step(&run_id, std::time::Duration::from_secs(1)).await?;
//!     // ... assert on run ...
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod fleet;
pub mod simulation;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use fleet::*;
pub use simulation::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("surge_control=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
