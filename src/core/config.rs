//! Configuration management for heapwatch.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (applied by the CLI)
//! - Validation and defaults

use crate::core::{HeapwatchError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for heapwatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Metrics engine configuration
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    pub listen_address: IpAddr,
    /// HTTP port serving ingestion and queries
    pub port: u16,
    /// Enable permissive CORS headers on the query API
    pub enable_cors: bool,
    /// Longest accepted line of an ingestion stream
    pub max_line_bytes: usize,
}

/// Which storage backend persists measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Newline-delimited JSON file per session
    Filesystem,
    /// Embedded label-indexed time-series engine
    Timeseries,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend used for measurement data
    pub backend: StorageBackendKind,
    /// Root directory for measurement data and the metadata database
    pub data_dir: PathBuf,
    /// Force a sync to disk after every append
    pub sync_write: bool,
}

/// Metrics engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of most recent points kept per call-site
    pub window: usize,
    /// Window lengths to report. Accepted and validated, not used by the regression.
    #[serde(with = "duration_list")]
    pub averaging_windows: Vec<Duration>,
    /// Per-subscriber buffer of pending metric updates
    pub subscription_buffer: usize,
    /// Keep results of cold (replayed) sessions in the result cache
    pub cold_path_cache: bool,
    /// Result cache limits
    pub cache: CacheConfig,
}

/// Bounded result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound of the summed entry sizes in bytes
    pub max_total_size: usize,
    /// Time an entry stays valid after insertion
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Interval between garbage collection passes
    #[serde(with = "humantime_serde")]
    pub gc_frequency: Duration,
    /// Longest time a single garbage collection pass may hold the cache
    #[serde(with = "humantime_serde")]
    pub gc_max_pause: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured logging format
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            debug: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 46219,
            enable_cors: true,
            max_line_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackendKind::Filesystem,
            data_dir: PathBuf::from("./heapwatch_data"),
            sync_write: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            window: 300,
            averaging_windows: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            subscription_buffer: 16,
            cold_path_cache: false,
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_total_size: 64 * 1024 * 1024, // 64MB
            ttl: Duration::from_secs(60),
            gc_frequency: Duration::from_secs(30),
            gc_max_pause: Duration::from_millis(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(HeapwatchError::config("port must be greater than 0"));
        }

        if self.server.max_line_bytes == 0 {
            return Err(HeapwatchError::config("max_line_bytes must be greater than 0"));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(HeapwatchError::config("data_dir cannot be empty"));
        }

        if self.metrics.window < 2 {
            return Err(HeapwatchError::config(format!(
                "metrics window must hold at least 2 points, got {}",
                self.metrics.window
            )));
        }

        if let Some(zero) = self.metrics.averaging_windows.iter().find(|w| w.is_zero()) {
            return Err(HeapwatchError::config(format!(
                "averaging windows must be positive, got {:?}",
                zero
            )));
        }

        if self.metrics.subscription_buffer == 0 {
            return Err(HeapwatchError::config("subscription_buffer must be greater than 0"));
        }

        let cache = &self.metrics.cache;
        if cache.max_total_size == 0 {
            return Err(HeapwatchError::config("cache max_total_size must be greater than 0"));
        }
        if cache.ttl.is_zero() || cache.gc_frequency.is_zero() {
            return Err(HeapwatchError::config("cache ttl and gc_frequency must be positive"));
        }

        Ok(())
    }

    /// Path of the SQLite metadata database
    pub fn metadata_path(&self) -> PathBuf {
        self.storage.data_dir.join("metadata.db")
    }
}

/// Lists of human readable durations (`[1m, 5m]`).
mod duration_list {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(windows: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(windows.iter().map(|w| Serde::from(*w)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<Serde<Duration>>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(Serde::into_inner).collect())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| HeapwatchError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set HTTP port
    pub fn port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set storage backend
    pub fn backend(mut self, backend: StorageBackendKind) -> Self {
        self.config.storage.backend = backend;
        self
    }

    /// Set data directory
    pub fn data_dir(mut self, path: PathBuf) -> Self {
        self.config.storage.data_dir = path;
        self
    }

    /// Enable sync-to-disk after every append
    pub fn sync_write(mut self, enable: bool) -> Self {
        self.config.storage.sync_write = enable;
        self
    }

    /// Set rolling window length
    pub fn window(mut self, points: usize) -> Self {
        self.config.metrics.window = points;
        self
    }

    /// Enable caching of cold-path results
    pub fn cold_path_cache(mut self, enable: bool) -> Self {
        self.config.metrics.cold_path_cache = enable;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
