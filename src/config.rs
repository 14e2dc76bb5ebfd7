//! Configuration management
//!
//! TOML file support with environment variable overrides and defaults
//! matching the pool and query limits the library uses when nothing is
//! configured.
//!
//! ```toml
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! prefix = "app:"
//! max_active = 12000
//!
//! [query]
//! max_pipeline_size = 8000
//! bucket_width_ms = 86400000
//!
//! [tags]
//! materialize_ttl_secs = 300
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{Error, Result};
use crate::redis::{BucketLayout, RedisConfig, RetryPolicy};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Store connection and pool settings
    #[serde(default)]
    pub redis: RedisSection,

    /// Range query settings
    #[serde(default)]
    pub query: QuerySection,

    /// Tag index settings
    #[serde(default)]
    pub tags: TagsSection,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Store connection and pool settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedisSection {
    /// Server URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Default key namespace for the command line client
    #[serde(default)]
    pub prefix: String,

    /// Idle connections kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,

    /// Connections borrowed at once
    #[serde(default = "default_max_active")]
    pub max_active: u32,

    /// Idle connections older than this are closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Dial timeout
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// How long a borrow waits for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Wait for a free connection instead of failing immediately
    #[serde(default = "default_true")]
    pub wait_for_connection: bool,

    /// PING reused connections before handing them out
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,

    /// Dial retries before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Use TLS (requires the `redis-tls` feature)
    #[serde(default)]
    pub tls_enabled: bool,
}

/// Range query settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuerySection {
    /// Upper bound on bucket sub-queries per logical query
    #[serde(default = "default_max_pipeline_size")]
    pub max_pipeline_size: usize,

    /// Bucket width in timestamp units
    #[serde(default = "default_bucket_width_ms")]
    pub bucket_width_ms: i64,
}

/// Tag index settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TagsSection {
    /// Lifetime of sets materialized by `get_tags`; 0 disables expiry
    #[serde(default = "default_materialize_ttl_secs")]
    pub materialize_ttl_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_max_idle() -> u32 { 80 }
fn default_max_active() -> u32 { 12_000 }
fn default_idle_timeout_secs() -> u64 { 240 }
fn default_connection_timeout_ms() -> u64 { 5_000 }
fn default_acquire_timeout_ms() -> u64 { 5_000 }
fn default_max_retries() -> u32 { 3 }
fn default_max_pipeline_size() -> usize { crate::redis::DEFAULT_MAX_PIPELINE_SIZE }
fn default_bucket_width_ms() -> i64 { crate::redis::DEFAULT_BUCKET_WIDTH_MS }
fn default_materialize_ttl_secs() -> u64 { 300 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            prefix: String::new(),
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connection_timeout_ms: default_connection_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            wait_for_connection: true,
            test_on_borrow: true,
            max_retries: default_max_retries(),
            tls_enabled: false,
        }
    }
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            max_pipeline_size: default_max_pipeline_size(),
            bucket_width_ms: default_bucket_width_ms(),
        }
    }
}

impl Default for TagsSection {
    fn default() -> Self {
        Self {
            materialize_ttl_secs: default_materialize_ttl_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// `TSDB_REDIS_URL`, `TSDB_PREFIX`, `TSDB_MAX_ACTIVE`, `TSDB_MAX_IDLE`,
    /// `TSDB_MAX_PIPELINE`, `TSDB_BUCKET_WIDTH_MS` and `RUST_LOG`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Redis
        if let Some(url) = lookup("TSDB_REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(prefix) = lookup("TSDB_PREFIX") {
            self.redis.prefix = prefix;
        }
        override_parsed(&lookup, "TSDB_MAX_ACTIVE", &mut self.redis.max_active);
        override_parsed(&lookup, "TSDB_MAX_IDLE", &mut self.redis.max_idle);

        // Query
        override_parsed(&lookup, "TSDB_MAX_PIPELINE", &mut self.query.max_pipeline_size);
        override_parsed(&lookup, "TSDB_BUCKET_WIDTH_MS", &mut self.query.bucket_width_ms);

        // Logging
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.query.max_pipeline_size == 0 {
            return Err(Error::Configuration(
                "max_pipeline_size must be > 0".to_string(),
            ));
        }
        self.bucket_layout()?;
        self.pool_config().validate()
    }

    /// Pool configuration derived from the `[redis]` section
    pub fn pool_config(&self) -> RedisConfig {
        let r = &self.redis;
        RedisConfig::with_url(r.url.clone())
            .max_idle(r.max_idle)
            .max_active(r.max_active)
            .idle_timeout(Duration::from_secs(r.idle_timeout_secs))
            .connection_timeout(Duration::from_millis(r.connection_timeout_ms))
            .acquire_timeout(Duration::from_millis(r.acquire_timeout_ms))
            .wait_for_connection(r.wait_for_connection)
            .test_on_borrow(r.test_on_borrow)
            .retry_policy(RetryPolicy {
                max_retries: r.max_retries,
                ..Default::default()
            })
            .tls(r.tls_enabled)
    }

    /// Bucket layout derived from the `[query]` section
    pub fn bucket_layout(&self) -> Result<BucketLayout> {
        BucketLayout::new(self.query.bucket_width_ms)
    }

    /// Lifetime of sets materialized by `get_tags`
    pub fn materialize_ttl(&self) -> Duration {
        Duration::from_secs(self.tags.materialize_ttl_secs)
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring {}={:?}: not a valid number", name, raw),
        }
    }
}
