//! Logging initialisation for the `genq` binary.
//!
//! Library code logs through `log` and opens `tracing` spans; this installs
//! one `tracing-subscriber` registry that receives both.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global logger is already installed")]
    AlreadyInstalled,
}

/// Builds the filter: `RUST_LOG` wins over the configured one.
pub fn env_filter(configured: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(configured).map_err(|e| LoggingError::InvalidFilter {
        filter: configured.to_string(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber and the `log` bridge. Logs go to stderr
/// so stdout stays free for command output.
pub fn init(format: LogFormat, filter: &str) -> Result<(), LoggingError> {
    let filter = env_filter(filter)?;
    tracing_log::LogTracer::init().map_err(|_| LoggingError::AlreadyInstalled)?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            ),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            ),
        ),
    };
    installed.map_err(|_| LoggingError::AlreadyInstalled)
}
