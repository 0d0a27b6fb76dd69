//! Database, write broker and screen configuration.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Minimum cache size: 1 MB.
const MIN_CACHE_SIZE_BYTES: usize = 1024 * 1024;

/// Upper bound for the shared write transaction age ceiling.
const MAX_TXN_AGE: Duration = Duration::from_secs(60);

/// Database configuration.
///
/// # Validation Rules
///
/// - `cache_size_bytes` must be >= 1 MB (1,048,576 bytes)
/// - `broker` must itself be valid
///
/// # Example
///
/// ```no_run
/// # use tunerdb_types::config::DatabaseConfig;
/// let config = DatabaseConfig::builder()
///     .cache_size_bytes(16 * 1024 * 1024)
///     .log_retention_txns(500)
///     .build()
///     .expect("valid database config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseConfig {
    /// Page cache size handed to the storage engine.
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: usize,
    /// Shared write transaction settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Whether writes append change-log entries.
    ///
    /// Screens built on a database without a change log can only refresh by rescanning.
    #[serde(default = "default_change_log")]
    pub change_log: bool,
    /// Number of most recent transactions kept by `clean_log_default`.
    #[serde(default = "default_log_retention_txns")]
    pub log_retention_txns: u64,
}

#[bon::bon]
impl DatabaseConfig {
    /// Creates a new database configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if:
    /// - `cache_size_bytes` < 1 MB
    /// - the broker configuration is invalid
    #[builder]
    pub fn new(
        #[builder(default = default_cache_size())] cache_size_bytes: usize,
        #[builder(default)] broker: BrokerConfig,
        #[builder(default = default_change_log())] change_log: bool,
        #[builder(default = default_log_retention_txns())] log_retention_txns: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self { cache_size_bytes, broker, change_log, log_retention_txns };
        config.validate()?;
        Ok(config)
    }
}

impl DatabaseConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(ConfigError::Validation {
                message: format!(
                    "cache_size_bytes must be >= {} (1 MB), got {}",
                    MIN_CACHE_SIZE_BYTES, self.cache_size_bytes
                ),
            });
        }
        self.broker.validate()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: default_cache_size(),
            broker: BrokerConfig::default(),
            change_log: default_change_log(),
            log_retention_txns: default_log_retention_txns(),
        }
    }
}

fn default_cache_size() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_change_log() -> bool {
    true
}

fn default_log_retention_txns() -> u64 {
    10_000
}

// =========================================================================
// BrokerConfig
// =========================================================================

fn default_max_txn_age() -> Duration {
    Duration::from_millis(200)
}

/// Shared write transaction broker configuration.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use tunerdb_types::config::BrokerConfig;
/// let config = BrokerConfig::builder()
///     .max_txn_age(Duration::from_millis(50))
///     .build()
///     .expect("valid broker config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Age after which a released shared transaction commits even when another thread waits.
    ///
    /// Checked on release only. Must be in (0, 60s]. Default: 200ms.
    #[serde(default = "default_max_txn_age")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub max_txn_age: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { max_txn_age: default_max_txn_age() }
    }
}

#[bon::bon]
impl BrokerConfig {
    /// Creates a new broker configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `max_txn_age` is zero or above 60 seconds.
    #[builder]
    pub fn new(
        #[builder(default = default_max_txn_age())] max_txn_age: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_txn_age };
        config.validate()?;
        Ok(config)
    }
}

impl BrokerConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_txn_age.is_zero() || self.max_txn_age > MAX_TXN_AGE {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_txn_age must be in (0, {}], got {}",
                    humantime::format_duration(MAX_TXN_AGE),
                    humantime::format_duration(self.max_txn_age)
                ),
            });
        }
        Ok(())
    }
}

// =========================================================================
// ScreenConfig
// =========================================================================

fn default_small_jump_rows() -> usize {
    32
}

/// Screen (live sorted view) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScreenConfig {
    /// Jumps of at most this many rows move the primary reference; larger jumps move the
    /// auxiliary one.
    ///
    /// Must be >= 1. Default: 32.
    #[serde(default = "default_small_jump_rows")]
    pub small_jump_rows: usize,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self { small_jump_rows: default_small_jump_rows() }
    }
}

#[bon::bon]
impl ScreenConfig {
    /// Creates a new screen configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `small_jump_rows` is zero.
    #[builder]
    pub fn new(
        #[builder(default = default_small_jump_rows())] small_jump_rows: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { small_jump_rows };
        config.validate()?;
        Ok(config)
    }
}

impl ScreenConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.small_jump_rows == 0 {
            return Err(ConfigError::Validation {
                message: "small_jump_rows must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}
