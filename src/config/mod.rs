//! Broker configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "INTEROP_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "INTEROP";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "INTEROP_LOG";

/// Default metadata directory.
pub const DEFAULT_METADATA_DIR: &str = "metadata";
/// Default metadata document name inside the metadata directory.
pub const DEFAULT_METADATA_FILE: &str = "interop.json";

/// Application launcher service bridged by default.
pub const APP_LAUNCHER_SERVICE: &str = "interop.AppLauncherService";
/// Launch notification stream on the application launcher service.
pub const APP_LAUNCHED_EVENT_STREAM: &str = "AppLaunchedEventStream";

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main broker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata document location and reload policy.
    pub metadata: MetadataConfig,
    /// Call relay tuning.
    pub invocation: InvocationConfig,
    /// Remote event stream bridges.
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Where the registry document lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub dir: PathBuf,
    pub file: String,
    /// Poll interval for document changes; 0 disables reloading.
    pub reload_interval_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_METADATA_DIR),
            file: DEFAULT_METADATA_FILE.to_string(),
            reload_interval_ms: 1000,
        }
    }
}

impl MetadataConfig {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_ms > 0).then(|| Duration::from_millis(self.reload_interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Items buffered per relay direction.
    pub channel_capacity: usize,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

/// A server-streaming method whose items are bridged into the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventSourceConfig {
    pub service: String,
    pub method: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub event_sources: Vec<EventSourceConfig>,
    /// Capacity of each local broadcast point.
    pub capacity: usize,
    pub retry: RetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_sources: vec![EventSourceConfig {
                service: APP_LAUNCHER_SERVICE.to_string(),
                method: APP_LAUNCHED_EVENT_STREAM.to_string(),
            }],
            capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// A failed bridge stays down until the provider reconnects.
    #[default]
    Never,
    /// Reopen with exponential backoff while the provider stays connected.
    Backoff,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub mode: RetryMode,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Never,
            min_delay_ms: 100,
            max_delay_ms: 5000,
            max_times: 10,
        }
    }
}
