//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired-up [`TestHarness`] and config factories with sensible
//! defaults for tests that drive the orchestrator tick by tick.

use std::sync::Arc;
use std::time::Duration;

use surge_control::clock::Clock;
use surge_control::config::{OrchestratorConfig, ScenarioConfig};
use surge_control::error::Result;
use surge_control::events::ControlEvent;
use surge_control::heartbeat::ResourceUsage;
use surge_control::orchestrator::Orchestrator;
use surge_control::retry::RetryPolicy;
use surge_control::run::RunRecord;
use surge_control::store::StateStore;
use surge_control::store::memory::InMemoryStateStore;
use surge_core::RunId;

use crate::fleet::SimulatedFleet;
use crate::simulation::{FaultConfig, SimulatedClock};
use crate::storage::FaultInjectingStore;

/// Orchestrator config for tick-driven tests.
///
/// No background poll loop, a short registration wait and fast retries.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default().manual_ticks();
    config.registration_timeout = Duration::from_secs(5);
    config.registration_poll_interval = Duration::from_millis(10);
    config.drain_timeout = Duration::from_secs(30);
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    config
}

/// Resource usage fixture.
pub const fn usage(cpu_pct: f64, memory_pct: f64) -> ResourceUsage {
    ResourceUsage {
        cpu_pct,
        memory_pct,
    }
}

/// Store, clock, fleet and orchestrator wired together.
#[derive(Debug)]
pub struct TestHarness {
    /// Backing store; the fleet always talks to it directly.
    pub store: Arc<InMemoryStateStore>,
    /// Clock shared by the orchestrator and the fleet.
    pub clock: Arc<SimulatedClock>,
    /// The simulated fleet, also the orchestrator's spawner.
    pub fleet: Arc<SimulatedFleet>,
    /// Orchestrator under test.
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// Harness with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Harness with a custom orchestrator config.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::assemble(config, |fleet| fleet, None).0
    }

    /// Harness whose spawned workers wait for an explicit `register`.
    pub fn without_registration(config: OrchestratorConfig) -> Self {
        Self::assemble(config, SimulatedFleet::without_registration, None).0
    }

    /// Harness whose orchestrator reads and writes through a faulty store.
    pub fn with_faults(
        config: OrchestratorConfig,
        faults: FaultConfig,
    ) -> (Self, Arc<FaultInjectingStore>) {
        let (harness, faulty) = Self::assemble(config, |fleet| fleet, Some(faults));
        (harness, faulty.expect("fault store requested"))
    }

    fn assemble(
        config: OrchestratorConfig,
        fleet: impl FnOnce(SimulatedFleet) -> SimulatedFleet,
        faults: Option<FaultConfig>,
    ) -> (Self, Option<Arc<FaultInjectingStore>>) {
        let store = Arc::new(InMemoryStateStore::new());
        let clock = Arc::new(SimulatedClock::deterministic());
        let fleet = Arc::new(fleet(SimulatedFleet::new(
            store.clone(),
            clock.clone(),
        )));

        let faulty = faults.map(|f| Arc::new(FaultInjectingStore::new(store.clone(), f)));
        let orchestrator_store: Arc<dyn StateStore> = match &faulty {
            Some(faulty) => faulty.clone(),
            None => store.clone(),
        };
        let orchestrator = Orchestrator::builder(orchestrator_store, fleet.clone())
            .config(config)
            .clock(clock.clone())
            .build();

        (
            Self {
                store,
                clock,
                fleet,
                orchestrator,
            },
            faulty,
        )
    }

    /// Creates and starts a run, then lets the fleet pick up `START`.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator or store error.
    pub async fn launch(&self, scenario: ScenarioConfig) -> Result<(RunId, RunRecord)> {
        let run_id = self.orchestrator.create_run(scenario).await?;
        let run = self.orchestrator.start_run(&run_id).await?;
        self.fleet.sync().await?;
        Ok((run_id, run))
    }

    /// Advances the clock, runs one fleet poll cycle, then one tick.
    ///
    /// # Errors
    ///
    /// Returns the fleet's store error or the tick error.
    pub async fn step(&self, run_id: &RunId, by: Duration) -> Result<RunRecord> {
        self.clock.advance(by);
        self.fleet.sync().await?;
        self.orchestrator.tick(run_id).await
    }

    /// Reports `fleet_qps` across the running fleet, then steps.
    ///
    /// # Errors
    ///
    /// Same as [`TestHarness::step`].
    pub async fn report_and_step(
        &self,
        run_id: &RunId,
        by: Duration,
        fleet_qps: f64,
        p95_ms: f64,
    ) -> Result<RunRecord> {
        self.clock.advance(by);
        self.fleet.sync().await?;
        self.fleet.report_all(fleet_qps, p95_ms).await?;
        self.orchestrator.tick(run_id).await
    }

    /// Every control event of a run, ascending.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn events(&self, run_id: &RunId) -> Result<Vec<ControlEvent>> {
        self.store.poll_events_since(run_id, 0).await
    }

    /// Current time on the shared clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
