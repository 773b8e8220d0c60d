//! Scenario and orchestrator configuration.
//!
//! [`ScenarioConfig`] is per run: it is validated once by `create_run` and
//! then stored on the run record, where workers read the opaque `workload`
//! blob. [`OrchestratorConfig`] is per process and carries every timing
//! threshold the control plane uses; it loads from `SURGE_*` environment
//! variables with strict positive-integer validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::guardrail::GuardrailConfig;
use crate::heartbeat::HealthThresholds;
use crate::retry::RetryPolicy;
use crate::scaling::step::FindMaxConfig;

/// Fraction of the target throughput that counts as "reached".
pub const THROUGHPUT_TARGET_FRACTION: f64 = 0.98;

/// How the scenario decides worker count and connection targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "mode",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum LoadMode {
    /// A fixed total connection count, allocated once at start.
    FixedTotal {
        /// Total connections across the fleet.
        total_connections: u32,
    },
    /// Ramp connections and add workers until a throughput target is met.
    ThroughputSeeking {
        /// Aggregate throughput to reach, in operations per second.
        target_qps: f64,
        /// Connections added to each below-ceiling worker per evaluation.
        ramp_step: u32,
        /// Expected throughput of one connection, used only to reject
        /// targets the bounds can never reach.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qps_per_connection_estimate: Option<f64>,
    },
    /// Capacity discovery: step total load up until stability fails.
    FindMax(FindMaxConfig),
}

impl LoadMode {
    /// Short label for logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::FixedTotal { .. } => "fixed_total",
            Self::ThroughputSeeking { .. } => "throughput_seeking",
            Self::FindMax(_) => "find_max",
        }
    }
}

/// Per-worker and fleet-size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBounds {
    /// Floor: no worker is ever targeted below this.
    pub min_connections_per_worker: u32,
    /// Ceiling: no worker is ever targeted above this.
    pub max_connections_per_worker: u32,
    /// Upper bound on fleet size, including guardrail scale-out.
    pub max_workers: u32,
}

impl Default for ScalingBounds {
    fn default() -> Self {
        Self {
            min_connections_per_worker: 1,
            max_connections_per_worker: 64,
            max_workers: 16,
        }
    }
}

/// What worker deaths do to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerFailurePolicy {
    /// Any dead worker fails the run.
    AnyDeath,
    /// Only the whole expected fleet being dead fails the run.
    #[default]
    FleetWide,
}

/// Validated description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Human-readable scenario name.
    pub name: String,
    /// Scaling mode.
    pub load: LoadMode,
    /// Unmeasured ramp-up time after start.
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    /// Measured time after warmup. Ignored in find-max mode, where the
    /// step controller decides when measurement ends.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Wind-down time between measurement and final processing.
    #[serde(with = "humantime_serde", default)]
    pub cooldown: Duration,
    /// Per-worker and fleet limits.
    #[serde(default)]
    pub bounds: ScalingBounds,
    /// Resource guardrails, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrails: Option<GuardrailConfig>,
    /// What worker deaths do to the run.
    #[serde(default)]
    pub worker_failure_policy: WorkerFailurePolicy,
    /// Workload description, consumed only by workers.
    #[serde(default)]
    pub workload: serde_json::Value,
}

impl ScenarioConfig {
    fn with_load(name: &str, load: LoadMode, bounds: ScalingBounds) -> Self {
        Self {
            name: name.to_string(),
            load,
            warmup: Duration::from_secs(10),
            duration: Duration::from_secs(60),
            cooldown: Duration::ZERO,
            bounds,
            guardrails: None,
            worker_failure_policy: WorkerFailurePolicy::default(),
            workload: serde_json::Value::Null,
        }
    }

    /// A fixed-total scenario with default timings.
    #[must_use]
    pub fn fixed_total(total_connections: u32, max_connections_per_worker: u32) -> Self {
        let bounds = ScalingBounds {
            max_connections_per_worker,
            ..ScalingBounds::default()
        };
        Self::with_load("fixed-total", LoadMode::FixedTotal { total_connections }, bounds)
    }

    /// A throughput-seeking scenario with default timings.
    #[must_use]
    pub fn throughput_seeking(target_qps: f64, ramp_step: u32, bounds: ScalingBounds) -> Self {
        Self::with_load(
            "throughput-seeking",
            LoadMode::ThroughputSeeking {
                target_qps,
                ramp_step,
                qps_per_connection_estimate: None,
            },
            bounds,
        )
    }

    /// A capacity-discovery scenario with default timings.
    #[must_use]
    pub fn find_max(config: FindMaxConfig, bounds: ScalingBounds) -> Self {
        Self::with_load("find-max", LoadMode::FindMax(config), bounds)
    }

    /// Sets warmup, measurement and cooldown durations.
    #[must_use]
    pub fn with_timings(mut self, warmup: Duration, duration: Duration, cooldown: Duration) -> Self {
        self.warmup = warmup;
        self.duration = duration;
        self.cooldown = cooldown;
        self
    }

    /// Sets the scaling bounds.
    #[must_use]
    pub fn with_bounds(mut self, bounds: ScalingBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Enables resource guardrails.
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: GuardrailConfig) -> Self {
        self.guardrails = Some(guardrails);
        self
    }

    /// Sets the worker failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: WorkerFailurePolicy) -> Self {
        self.worker_failure_policy = policy;
        self
    }

    /// Number of workers launched by `start_run`.
    #[must_use]
    pub fn initial_worker_count(&self) -> u32 {
        let cap = self.bounds.max_connections_per_worker.max(1);
        match &self.load {
            LoadMode::FixedTotal { total_connections } => total_connections.div_ceil(cap),
            LoadMode::ThroughputSeeking { .. } => 1,
            LoadMode::FindMax(find_max) => find_max.max_connections.div_ceil(cap),
        }
    }

    /// Total connections allocated across the initial fleet.
    #[must_use]
    pub const fn initial_total_connections(&self) -> u32 {
        match &self.load {
            LoadMode::FixedTotal { total_connections } => *total_connections,
            LoadMode::ThroughputSeeking { .. } => self.bounds.min_connections_per_worker,
            LoadMode::FindMax(find_max) => find_max.start_connections,
        }
    }

    /// Parses a scenario document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON or
    /// [`Error::ConfigInvalid`] if the parsed scenario fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Static validation performed by `create_run`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let bounds = &self.bounds;
        if bounds.min_connections_per_worker == 0 {
            return Err(Error::config_invalid(
                "bounds.minConnectionsPerWorker must be at least 1",
            ));
        }
        if bounds.min_connections_per_worker > bounds.max_connections_per_worker {
            return Err(Error::config_invalid(format!(
                "bounds floor {} exceeds ceiling {}",
                bounds.min_connections_per_worker, bounds.max_connections_per_worker
            )));
        }
        if bounds.max_workers == 0 {
            return Err(Error::config_invalid("bounds.maxWorkers must be at least 1"));
        }
        if self.duration.is_zero() && !matches!(self.load, LoadMode::FindMax(_)) {
            return Err(Error::config_invalid("duration must be greater than zero"));
        }

        match &self.load {
            LoadMode::FixedTotal { total_connections } => {
                self.validate_allocation(*total_connections)?;
            }
            LoadMode::ThroughputSeeking {
                target_qps,
                ramp_step,
                qps_per_connection_estimate,
            } => {
                if !target_qps.is_finite() || *target_qps <= 0.0 {
                    return Err(Error::config_invalid("targetQps must be a positive number"));
                }
                if *ramp_step == 0 {
                    return Err(Error::config_invalid("rampStep must be at least 1"));
                }
                if let Some(per_connection) = qps_per_connection_estimate {
                    let reachable = f64::from(bounds.max_workers)
                        * f64::from(bounds.max_connections_per_worker)
                        * per_connection;
                    if reachable * THROUGHPUT_TARGET_FRACTION < *target_qps {
                        return Err(Error::config_invalid(format!(
                            "throughput target {target_qps} is unreachable within bounds (at most {reachable:.1})"
                        )));
                    }
                }
            }
            LoadMode::FindMax(find_max) => {
                find_max.validate()?;
                self.validate_allocation(find_max.max_connections)?;
                let workers = self.initial_worker_count();
                if u64::from(find_max.start_connections)
                    < u64::from(bounds.min_connections_per_worker) * u64::from(workers)
                {
                    return Err(Error::config_invalid(format!(
                        "startConnections {} cannot give {workers} workers the floor of {}",
                        find_max.start_connections, bounds.min_connections_per_worker
                    )));
                }
            }
        }

        if let Some(guardrails) = &self.guardrails {
            guardrails.validate()?;
        }
        Ok(())
    }

    fn validate_allocation(&self, total: u32) -> Result<()> {
        if total == 0 {
            return Err(Error::config_invalid("total connections must be at least 1"));
        }
        let workers = self.initial_worker_count();
        if workers > self.bounds.max_workers {
            return Err(Error::config_invalid(format!(
                "{total} connections need {workers} workers but maxWorkers is {}",
                self.bounds.max_workers
            )));
        }
        if u64::from(total) < u64::from(self.bounds.min_connections_per_worker) * u64::from(workers)
        {
            return Err(Error::config_invalid(format!(
                "{total} connections cannot give {workers} workers the floor of {}",
                self.bounds.min_connections_per_worker
            )));
        }
        Ok(())
    }
}

const ENV_POLL_INTERVAL_MS: &str = "SURGE_POLL_INTERVAL_MS";
const ENV_REGISTRATION_TIMEOUT_SECS: &str = "SURGE_REGISTRATION_TIMEOUT_SECS";
const ENV_REGISTRATION_POLL_INTERVAL_MS: &str = "SURGE_REGISTRATION_POLL_INTERVAL_MS";
const ENV_DRAIN_TIMEOUT_SECS: &str = "SURGE_DRAIN_TIMEOUT_SECS";
const ENV_HEARTBEAT_STALE_SECS: &str = "SURGE_HEARTBEAT_STALE_SECS";
const ENV_HEARTBEAT_DEAD_SECS: &str = "SURGE_HEARTBEAT_DEAD_SECS";
const ENV_STORE_RETRY_MAX_ATTEMPTS: &str = "SURGE_STORE_RETRY_MAX_ATTEMPTS";
const ENV_STORE_RETRY_BASE_DELAY_MS: &str = "SURGE_STORE_RETRY_BASE_DELAY_MS";
const ENV_STORE_RETRY_MAX_DELAY_MS: &str = "SURGE_STORE_RETRY_MAX_DELAY_MS";
const ENV_AUTOSTART_POLL_LOOP: &str = "SURGE_AUTOSTART_POLL_LOOP";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REGISTRATION_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_STALE_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_DEAD_SECS: u64 = 60;
const DEFAULT_STORE_RETRY_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_STORE_RETRY_BASE_DELAY_MS: u64 = 50;
const DEFAULT_STORE_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Process-level control-plane settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Tick interval of each run's poll loop.
    pub poll_interval: Duration,
    /// Upper bound on how long `start_run` waits for every worker.
    pub registration_timeout: Duration,
    /// How often `start_run` re-reads heartbeats while waiting.
    pub registration_poll_interval: Duration,
    /// Upper bound on the two-phase stop.
    pub drain_timeout: Duration,
    /// Heartbeat age thresholds.
    pub health: HealthThresholds,
    /// Backoff for transient store failures.
    pub retry: RetryPolicy,
    /// Whether `start_run` spawns the background poll loop.
    pub autostart_poll_loop: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            registration_timeout: Duration::from_secs(DEFAULT_REGISTRATION_TIMEOUT_SECS),
            registration_poll_interval: Duration::from_millis(DEFAULT_REGISTRATION_POLL_INTERVAL_MS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            health: HealthThresholds {
                stale_after: Duration::from_secs(DEFAULT_HEARTBEAT_STALE_SECS),
                dead_after: Duration::from_secs(DEFAULT_HEARTBEAT_DEAD_SECS),
            },
            retry: RetryPolicy::default(),
            autostart_poll_loop: true,
        }
    }
}

impl OrchestratorConfig {
    /// Loads config from the process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer,
    /// exceeds the supported range, or the heartbeat thresholds are
    /// inverted.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// # Errors
    ///
    /// Same as [`OrchestratorConfig::from_env`].
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let poll_interval_ms =
            parse_positive_u64_env(&get_env, ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?;
        let registration_timeout_secs = parse_positive_u64_env(
            &get_env,
            ENV_REGISTRATION_TIMEOUT_SECS,
            DEFAULT_REGISTRATION_TIMEOUT_SECS,
        )?;
        let registration_poll_interval_ms = parse_positive_u64_env(
            &get_env,
            ENV_REGISTRATION_POLL_INTERVAL_MS,
            DEFAULT_REGISTRATION_POLL_INTERVAL_MS,
        )?;
        let drain_timeout_secs =
            parse_positive_u64_env(&get_env, ENV_DRAIN_TIMEOUT_SECS, DEFAULT_DRAIN_TIMEOUT_SECS)?;
        let stale_secs = parse_positive_u64_env(
            &get_env,
            ENV_HEARTBEAT_STALE_SECS,
            DEFAULT_HEARTBEAT_STALE_SECS,
        )?;
        let dead_secs =
            parse_positive_u64_env(&get_env, ENV_HEARTBEAT_DEAD_SECS, DEFAULT_HEARTBEAT_DEAD_SECS)?;
        let max_attempts = parse_positive_u64_env(
            &get_env,
            ENV_STORE_RETRY_MAX_ATTEMPTS,
            DEFAULT_STORE_RETRY_MAX_ATTEMPTS,
        )?;
        let base_delay_ms = parse_positive_u64_env(
            &get_env,
            ENV_STORE_RETRY_BASE_DELAY_MS,
            DEFAULT_STORE_RETRY_BASE_DELAY_MS,
        )?;
        let max_delay_ms = parse_positive_u64_env(
            &get_env,
            ENV_STORE_RETRY_MAX_DELAY_MS,
            DEFAULT_STORE_RETRY_MAX_DELAY_MS,
        )?;
        let autostart_poll_loop = parse_bool_env(&get_env, ENV_AUTOSTART_POLL_LOOP, true)?;

        if stale_secs >= dead_secs {
            return Err(Error::configuration(format!(
                "{ENV_HEARTBEAT_STALE_SECS} ({stale_secs}) must be less than {ENV_HEARTBEAT_DEAD_SECS} ({dead_secs})"
            )));
        }
        let max_attempts = u32::try_from(max_attempts).map_err(|_| {
            Error::configuration(format!(
                "{ENV_STORE_RETRY_MAX_ATTEMPTS} value {max_attempts} exceeds supported range"
            ))
        })?;

        Ok(Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            registration_timeout: Duration::from_secs(registration_timeout_secs),
            registration_poll_interval: Duration::from_millis(registration_poll_interval_ms),
            drain_timeout: Duration::from_secs(drain_timeout_secs),
            health: HealthThresholds {
                stale_after: Duration::from_secs(stale_secs),
                dead_after: Duration::from_secs(dead_secs),
            },
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
            },
            autostart_poll_loop,
        })
    }

    /// Disables the background poll loop; callers drive `tick` themselves.
    #[must_use]
    pub const fn manual_ticks(mut self) -> Self {
        self.autostart_poll_loop = false;
        self
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!("{key} must be greater than zero")));
    }
    Ok(parsed)
}

fn parse_bool_env<F>(get_env: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}
