//! Observability infrastructure for surge.
//!
//! Structured logging with consistent spans. Every control-plane operation
//! that touches a run logs inside a `run` span carrying the run ID, so a
//! single run's lifecycle can be filtered out of a multi-run log stream.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `surge_control=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if let Err(error) = result {
            eprintln!("surge: logging already initialised: {error}");
        }
    });
}

/// Creates a span for a run-scoped control-plane operation.
///
/// # Example
///
/// ```rust
/// use surge_core::observability::run_span;
///
/// let span = run_span("start_run", "01HX0000000000000000000000");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn run_span(operation: &str, run_id: &str) -> Span {
    tracing::info_span!("run", op = operation, run_id = run_id)
}

/// Creates a span for a worker-scoped operation within a run.
#[must_use]
pub fn worker_span(operation: &str, run_id: &str, worker_id: &str) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        run_id = run_id,
        worker_id = worker_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_names() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Json);
        init_logging(LogFormat::Pretty);
        let span = run_span("test", "run-1");
        let _guard = span.enter();
        tracing::info!("inside run span");
    }

    #[test]
    fn worker_span_can_be_entered() {
        let span = worker_span("heartbeat", "run-1", "worker-0");
        let _guard = span.enter();
    }
}
