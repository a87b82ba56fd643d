//! Structured logging configuration.
//!
//! Supports two modes:
//! - Development: pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `GRADSYNC_LOG_FORMAT=json` for production JSON logs.
//! Set `RUST_LOG` to control log levels (default: info). Stage handoffs
//! and collective group submissions log at `trace`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs for production.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        match std::env::var("GRADSYNC_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the logging subsystem. Safe to call more than once; later
/// calls are no-ops when a global subscriber is already set.
pub fn init() {
    init_with_format(LogFormat::from_env());
}

/// Initialize with an explicit format.
pub fn init_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };
    // Already-initialized subscribers are fine (tests, embedding hosts).
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_pretty() {
        // Unless the host environment set it explicitly.
        if std::env::var("GRADSYNC_LOG_FORMAT").is_err() {
            assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
        }
    }

    #[test]
    fn init_is_idempotent() {
        init_with_format(LogFormat::Pretty);
        init_with_format(LogFormat::Json);
    }
}
