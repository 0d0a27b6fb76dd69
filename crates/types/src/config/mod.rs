//! Configuration types for tunerdb.
//!
//! All config structs validate their values at construction time via
//! fallible builders. Post-deserialization validation is available via
//! the `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions. Allow `disallowed_methods` at the module level since config
// types are declarative structs with minimal procedural code.
#![allow(clippy::disallowed_methods)]

mod database;

pub use database::*;
use snafu::Snafu;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use super::*;

    // =========================================================================
    // DatabaseConfig validation tests
    // =========================================================================

    #[test]
    fn test_database_config_defaults_are_valid() {
        let config = DatabaseConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.cache_size_bytes, 64 * 1024 * 1024);
        assert!(config.change_log);
        assert_eq!(config.log_retention_txns, 10_000);
        assert_eq!(config.broker.max_txn_age, Duration::from_millis(200));
        assert_eq!(config, DatabaseConfig::default());
    }

    #[test]
    fn test_database_config_cache_size_minimum() {
        // Exactly 1 MB is valid
        let result = DatabaseConfig::builder().cache_size_bytes(1024 * 1024).build();
        assert!(result.is_ok());

        // Below 1 MB is invalid
        let result = DatabaseConfig::builder().cache_size_bytes(1024 * 1024 - 1).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("cache_size_bytes"));
        assert!(err.to_string().contains("1 MB"));
    }

    #[test]
    fn test_database_config_rejects_invalid_broker() {
        let broker = BrokerConfig { max_txn_age: Duration::ZERO };
        let result = DatabaseConfig::builder().broker(broker).build();
        assert!(result.unwrap_err().to_string().contains("max_txn_age"));
    }

    #[test]
    fn test_database_config_serde_defaults() {
        let config: DatabaseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DatabaseConfig::default());
    }

    #[test]
    fn test_database_config_serde_roundtrip() {
        let config = DatabaseConfig::builder()
            .change_log(false)
            .log_retention_txns(42)
            .broker(BrokerConfig::builder().max_txn_age(Duration::from_millis(75)).build().unwrap())
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"max_txn_age\":\"75ms\""));
        let parsed: DatabaseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    // =========================================================================
    // BrokerConfig validation tests
    // =========================================================================

    #[test]
    fn test_broker_config_bounds() {
        assert!(BrokerConfig::builder().max_txn_age(Duration::from_secs(60)).build().is_ok());
        assert!(BrokerConfig::builder().max_txn_age(Duration::from_secs(61)).build().is_err());
        assert!(BrokerConfig::builder().max_txn_age(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_broker_config_humantime_parse() {
        let config: BrokerConfig = serde_json::from_str(r#"{"max_txn_age":"1s 500ms"}"#).unwrap();
        assert_eq!(config.max_txn_age, Duration::from_millis(1500));
        assert!(serde_json::from_str::<BrokerConfig>(r#"{"max_txn_age":"soon"}"#).is_err());
    }

    // =========================================================================
    // ScreenConfig validation tests
    // =========================================================================

    #[test]
    fn test_screen_config_defaults_and_minimum() {
        assert_eq!(ScreenConfig::builder().build().unwrap().small_jump_rows, 32);
        assert!(ScreenConfig::builder().small_jump_rows(1).build().is_ok());
        let err = ScreenConfig::builder().small_jump_rows(0).build().unwrap_err();
        assert!(err.to_string().contains("small_jump_rows"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation { message: "test error".to_string() };
        assert_eq!(err.to_string(), "invalid config: test error");
    }

    // =========================================================================
    // JsonSchema tests
    // =========================================================================

    #[test]
    fn test_database_config_json_schema_has_fields() {
        let schema = schemars::schema_for!(DatabaseConfig);
        let json = serde_json::to_string(&schema).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.get("title").and_then(|v| v.as_str()), Some("DatabaseConfig"));
        let props = value.get("properties").and_then(|v| v.as_object()).unwrap();
        assert!(props.contains_key("cache_size_bytes"));
        assert!(props.contains_key("broker"));
        assert!(props.contains_key("change_log"));
        assert!(props.contains_key("log_retention_txns"));
    }
}
