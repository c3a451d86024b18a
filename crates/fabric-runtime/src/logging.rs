//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; embedding applications call
//! [`init`] once at startup (or install their own subscriber). `RUST_LOG`
//! overrides the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Unknown log format '{0}' (expected text or json)")]
    UnknownFormat(String),

    #[error("Failed to install subscriber: {0}")]
    AlreadyInitialized(String),
}

/// Filter from `RUST_LOG` when set, else from `config.level`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::InvalidFilter(config.level.clone(), e.to_string())),
    }
}

fn build_layer(config: &LoggingConfig) -> Result<Box<dyn Layer<Registry> + Send + Sync>, LoggingError> {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let layer = match (config.format.to_ascii_lowercase().as_str(), config.timestamps) {
        ("text", true) => layer.boxed(),
        ("text", false) => layer.without_time().boxed(),
        ("json", true) => layer.json().boxed(),
        ("json", false) => layer.json().without_time().boxed(),
        (other, _) => return Err(LoggingError::UnknownFormat(other.to_string())),
    };
    Ok(layer)
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails on an invalid level or format, or when a global subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let layer = build_layer(config)?;
    let filter = build_filter(config)?;
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(level: &str, format: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            format: format.to_string(),
            timestamps: false,
        }
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let err = build_layer(&logging("info", "xml")).err().unwrap();
        assert!(matches!(err, LoggingError::UnknownFormat(ref f) if f == "xml"));
    }

    #[test]
    fn test_layers_build_for_known_formats() {
        assert!(build_layer(&logging("info", "text")).is_ok());
        assert!(build_layer(&logging("info", "JSON")).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = logging("fabric_runtime=debug", "text");
        let first = init(&config);
        let second = init(&config);
        // another test binary may already own the global subscriber
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized(_))));
    }
}
