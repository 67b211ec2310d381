//! Logging initialization
//!
//! Installs a `tracing` subscriber with:
//! - `RUST_LOG`-style filtering, with a sensible default when unset
//! - JSON structured output, or human-readable output for local runs

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,tasklane=debug,kube=info,tower=warn,hyper=warn";

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line (e.g., "tasklane-operator")
    pub service_name: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tasklane".to_string(),
            json: true,
        }
    }
}

/// Build the env filter, falling back to `DEFAULT_LOG_FILTER`
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize the global tracing subscriber
///
/// Fails if a subscriber was already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter());

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| Error::telemetry(e.to_string()))?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
