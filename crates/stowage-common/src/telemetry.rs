//! Structured logging setup
//!
//! Installs a JSON `tracing-subscriber` formatter filtered by `RUST_LOG`,
//! falling back to a default directive set tuned for the operator.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "info,stowage=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line as a span field
    pub service_name: String,
    /// Emit JSON (true) or human-readable lines (false)
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "stowage".to_string(),
            json: true,
        }
    }
}

/// Build the env filter, preferring `RUST_LOG`
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_emits_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "stowage");
        assert!(config.json);
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
