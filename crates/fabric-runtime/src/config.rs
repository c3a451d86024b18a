//! Fabric settings, loadable from YAML or TOML
//!
//! Every section and field is optional; anything left out keeps its default.
//!
//! ```yaml
//! executor:
//!   max_concurrency: 8
//!   default_batch_size: 250
//!
//! monitor:
//!   interval_ms: 500
//!   idle_after_ms: 10000
//!
//! cache:
//!   enabled: true
//!   default_ttl_secs: 60
//!
//! aggregation:
//!   strict_empty_average: false
//!
//! logging:
//!   level: info
//!   format: json
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings, one section per subsystem
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FabricConfig {
    /// Concurrent execution settings
    pub executor: ExecutorConfig,

    /// Stream monitor settings
    pub monitor: MonitorConfig,

    /// Join / pipeline result caching
    pub cache: CacheConfig,

    /// Aggregation edge-case policy
    pub aggregation: AggregationConfig,

    /// Subscriber installed by [`crate::logging::init`]
    pub logging: LoggingConfig,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of stream fetches running at once
    pub max_concurrency: usize,

    /// Batch size given to streams registered without one
    pub default_batch_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            default_batch_size: 100,
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between two monitor ticks
    pub interval_ms: u64,

    /// A stream with no fetch for this long is reported idle
    pub idle_after_ms: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            idle_after_ms: 30_000,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, TTL arguments are ignored and nothing is cached
    pub enabled: bool,

    /// TTL applied to joins and pipelines run through the facade without
    /// one; unset means such calls are not cached
    pub default_ttl_secs: Option<u64>,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: None,
        }
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AggregationConfig {
    /// Fail `average` over an empty record set instead of returning 0,
    /// unless the rule carries a default
    pub strict_empty_average: bool,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// `text` or `json`
    pub format: String,

    /// Prefix each line with a timestamp
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            timestamps: true,
        }
    }
}

impl FabricConfig {
    /// Read a config file. `.yaml`/`.yml` and `.toml` pick the format; any
    /// other extension tries YAML, then TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Overlay `other`: any field it sets away from the default wins.
    pub fn merge(&mut self, other: FabricConfig) {
        let executor_defaults = ExecutorConfig::default();
        if other.executor.max_concurrency != executor_defaults.max_concurrency {
            self.executor.max_concurrency = other.executor.max_concurrency;
        }
        if other.executor.default_batch_size != executor_defaults.default_batch_size {
            self.executor.default_batch_size = other.executor.default_batch_size;
        }

        let monitor_defaults = MonitorConfig::default();
        if other.monitor.interval_ms != monitor_defaults.interval_ms {
            self.monitor.interval_ms = other.monitor.interval_ms;
        }
        if other.monitor.idle_after_ms != monitor_defaults.idle_after_ms {
            self.monitor.idle_after_ms = other.monitor.idle_after_ms;
        }

        if !other.cache.enabled {
            self.cache.enabled = false;
        }
        if other.cache.default_ttl_secs.is_some() {
            self.cache.default_ttl_secs = other.cache.default_ttl_secs;
        }

        if other.aggregation.strict_empty_average {
            self.aggregation.strict_empty_average = true;
        }

        let logging_defaults = LoggingConfig::default();
        if other.logging.level != logging_defaults.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.format != logging_defaults.format {
            self.logging.format = other.logging.format;
        }
        if !other.logging.timestamps {
            self.logging.timestamps = false;
        }
    }

    /// Default settings rendered as YAML
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::default()).unwrap_or_default()
    }
}

/// Errors from reading or parsing a config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
