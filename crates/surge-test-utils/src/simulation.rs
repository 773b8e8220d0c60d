//! Deterministic time and fault configuration for control-plane tests.
//!
//! The orchestrator derives heartbeat health, phase boundaries and drain
//! deadlines from its [`Clock`]. Driving that clock by hand makes every
//! timing decision reproducible without sleeping.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use surge_control::clock::Clock;
//! use surge_test_utils::simulation::SimulatedClock;
//!
//! let clock = SimulatedClock::deterministic();
//! let t0 = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!((clock.now() - t0).num_seconds(), 30);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use surge_control::clock::Clock;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a transient failure on a read call (0.0 - 1.0).
    pub read_failure_rate: f64,

    /// Probability of a transient failure on a write call (0.0 - 1.0).
    pub write_failure_rate: f64,

    /// Seed for the failure RNG.
    pub seed: u64,
}

impl FaultConfig {
    /// Creates a config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Creates a config where every kind of call fails at `rate`.
    #[must_use]
    pub fn flaky(rate: f64, seed: u64) -> Self {
        Self {
            read_failure_rate: rate,
            write_failure_rate: rate,
            seed,
        }
    }
}

/// Simulated clock for deterministic time control.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a new simulated clock starting at the given time.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed instant.
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("valid base timestamp");
        Self::new(base)
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Returns elapsed time since simulation start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = i64::try_from(self.elapsed_ms.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
        self.base + chrono::Duration::milliseconds(elapsed)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_monotonically() {
        let clock = SimulatedClock::deterministic();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(1500));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
        assert_eq!((clock.now() - t0).num_milliseconds(), 2000);
    }
}
