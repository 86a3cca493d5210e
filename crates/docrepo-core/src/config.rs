//! Configuration management for docrepo
//!
//! This module provides a centralized configuration system that supports:
//! - YAML/TOML configuration files
//! - Environment variable overrides
//! - Reasonable defaults
//! - Configuration validation

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::strata::Strata;

/// Upper bound for a lock lease (one year).
pub const MAX_LEASE_SECS: u64 = 365 * 24 * 3600;

/// Root configuration structure for docrepo
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RepoConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RepoConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. Config file specified by DOCREPO_CONFIG env var
    /// 3. ./config/docrepo.{yaml,toml}
    /// 4. Hardcoded defaults (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        if let Ok(config_path) = std::env::var("DOCREPO_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder.add_source(File::with_name("./config/docrepo").required(false));

        // Example: DOCREPO__LOCK__LEASE_SECS=120
        builder = builder.add_source(
            Environment::with_prefix("DOCREPO")
                .separator("__")
                .try_parsing(true),
        );

        let config: RepoConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Set default values for all scalar configuration options
    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            // Store
            .set_default("store.url", "memory://")?
            .set_default("store.max_connections", 8)?
            // Lock
            .set_default("lock.lease_secs", 30)?
            .set_default("lock.retry.max_attempts", 10)?
            .set_default("lock.retry.initial_backoff_ms", 50)?
            .set_default("lock.retry.max_backoff_ms", 2000)?
            .set_default("lock.retry.backoff_multiplier", 2.0)?
            // Index
            .set_default("index.mode", "by_schema")?
            .set_default("index.drop_unknown", true)?
            // Buffer
            .set_default("buffer.batch_size", 100)?
            .set_default("buffer.max_wait_ms", 5000)?
            .set_default("buffer.flush_interval_ms", 1000)?
            // Compression
            .set_default("compression.enabled", false)?
            .set_default("compression.worker_interval_secs", 3600)?
            // Logging
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.scheme().is_none() {
            return Err(ConfigError::Message(format!(
                "store.url `{}` is not a supported connection target (memory:// or sqlite://)",
                self.store.url
            )));
        }

        if self.store.max_connections == 0 {
            return Err(ConfigError::Message(
                "store.max_connections must be > 0".to_string(),
            ));
        }

        if self.lock.lease_secs == 0 || self.lock.lease_secs > MAX_LEASE_SECS {
            return Err(ConfigError::Message(format!(
                "lock.lease_secs must be within 1..={MAX_LEASE_SECS}"
            )));
        }

        if self.lock.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "lock.retry.max_attempts must be > 0".to_string(),
            ));
        }

        self.buffer.validate().map_err(ConfigError::Message)?;

        if self.compression.worker_interval_secs == 0 {
            return Err(ConfigError::Message(
                "compression.worker_interval_secs must be > 0".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Message(format!(
                "logging.format must be `pretty` or `json`, got `{}`",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: RepoConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }
}

/// Supported store backends, derived from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScheme {
    Memory,
    Sqlite,
}

/// Document store connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// `memory://` or `sqlite://<path>`
    pub url: String,

    /// Max connections in pool (SQLite only)
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    /// Backend selected by the URL, `None` when unparseable.
    pub fn scheme(&self) -> Option<StoreScheme> {
        if self.url == "memory://" || self.url == "memory" {
            Some(StoreScheme::Memory)
        } else if self.url.starts_with("sqlite:") && self.url.len() > "sqlite:".len() {
            Some(StoreScheme::Sqlite)
        } else {
            None
        }
    }
}

/// Entity lock configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    /// Lease granted by each successful acquisition
    pub lease_secs: u64,

    /// Name written to locks for operators (hostname, worker id)
    #[serde(default)]
    pub actor: Option<String>,

    /// Backoff used by `acquire_with_retry`
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            actor: None,
            retry: RetryConfig::default(),
        }
    }
}

impl LockConfig {
    /// Lease as a chrono duration, for timestamp arithmetic
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(MAX_LEASE_SECS) as i64)
    }
}

/// Retry configuration for lock acquisition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff delay for a given retry attempt
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
        .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// How declared indexes are reconciled against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexReconcileMode {
    /// Report drift only
    Disabled,
    /// Create, recreate and drop indexes to match the declaration
    #[default]
    BySchema,
    /// Refuse to start when drift exists
    FailFast,
}

/// Index lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    pub mode: IndexReconcileMode,

    /// Drop live indexes the collection does not declare (BySchema only)
    pub drop_unknown: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            mode: IndexReconcileMode::BySchema,
            drop_unknown: true,
        }
    }
}

/// Write buffer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Pending entries that trigger a flush
    pub batch_size: usize,

    /// Maximum age of the oldest pending entry before a flush (ms)
    pub max_wait_ms: u64,

    /// Background flush worker period (ms)
    pub flush_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_wait_ms: 5000,
            flush_interval_ms: 1000,
        }
    }
}

impl BufferConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("buffer.batch_size must be > 0".to_string());
        }

        if self.batch_size > 100_000 {
            return Err("buffer.batch_size too large (max: 100,000)".to_string());
        }

        if self.flush_interval_ms == 0 {
            return Err("buffer.flush_interval_ms must be > 0".to_string());
        }

        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Age-based compression configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionConfig {
    /// Run the background compression worker
    pub enabled: bool,

    /// Worker period in seconds
    pub worker_interval_secs: u64,

    /// Ordered retention ladder; walked in this order
    #[serde(default)]
    pub stratas: Vec<Strata>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_interval_secs: 3600,
            stratas: Vec::new(),
        }
    }
}

impl CompressionConfig {
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (default: "info")
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::Granularity;

    #[test]
    fn test_default_configuration() {
        let config = RepoConfig::default();

        assert_eq!(config.store.url, "memory://");
        assert_eq!(config.store.scheme(), Some(StoreScheme::Memory));
        assert_eq!(config.lock.lease_secs, 30);
        assert_eq!(config.lock.lease(), chrono::Duration::seconds(30));
        assert_eq!(config.index.mode, IndexReconcileMode::BySchema);
        assert!(config.index.drop_unknown);
        assert_eq!(config.buffer.batch_size, 100);
        assert!(!config.compression.enabled);
        assert!(config.compression.stratas.is_empty());
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_backoff() {
        let retry = RetryConfig::default();

        assert_eq!(retry.backoff_for_attempt(0).as_millis(), 50);
        assert_eq!(retry.backoff_for_attempt(1).as_millis(), 100);
        assert_eq!(retry.backoff_for_attempt(2).as_millis(), 200);
        assert!(retry.backoff_for_attempt(20).as_millis() <= 2000);
    }

    #[test]
    fn test_store_scheme() {
        let mut store = StoreConfig::default();
        store.url = "sqlite://data/docrepo.db".to_string();
        assert_eq!(store.scheme(), Some(StoreScheme::Sqlite));
        store.url = "mongodb://localhost".to_string();
        assert_eq!(store.scheme(), None);
        store.url = "sqlite:".to_string();
        assert_eq!(store.scheme(), None);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RepoConfig::default();

        config.store.url = "postgres://nowhere".to_string();
        assert!(config.validate().is_err());
        config.store.url = "memory://".to_string();

        config.lock.lease_secs = 0;
        assert!(config.validate().is_err());
        config.lock.lease_secs = 30;

        config.buffer.batch_size = 0;
        assert!(config.validate().is_err());
        config.buffer.batch_size = 10;

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "json".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_and_stratas_deserialize() {
        let json = r#"{
            "index": { "mode": "fail_fast", "drop_unknown": false },
            "compression": {
                "enabled": true,
                "worker_interval_secs": 60,
                "stratas": [
                    { "compress_per": "day" },
                    { "compress_per": "month", "compress_after": "month" }
                ]
            }
        }"#;
        let config: RepoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.index.mode, IndexReconcileMode::FailFast);
        assert_eq!(config.compression.stratas.len(), 2);
        assert_eq!(
            config.compression.stratas[1].compress_after,
            Some(Granularity::Month)
        );
    }
}
