//! Configuration for the zaguan driver.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::EndPoint;

/// Client configuration: the seed server list plus pool tuning.
///
/// The pool consumes these as already-validated scalar values; call
/// [`ClientConfig::validate`] (done automatically when loading from a file
/// or constructing a pool) before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seed list of server endpoints, each `host` or `host:port`
    pub servers: Vec<String>,
    /// Connection pool tuning
    #[serde(default)]
    pub pool: PoolSettings,
}

/// Connection pool tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections kept open even when idle
    pub min_pool_size: usize,
    /// Hard cap on open connections
    pub max_pool_size: usize,
    /// Maximum age of a pooled connection in milliseconds; 0 disables the limit
    pub connection_lifetime_ms: u64,
    /// How long an acquire may wait for a free slot, in milliseconds
    pub connection_timeout_ms: u64,
    /// TCP connect and per-operation I/O deadline, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 0,
            max_pool_size: 100,
            connection_lifetime_ms: 0,
            connection_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl PoolSettings {
    /// Connection lifetime as a duration; zero means unlimited.
    pub fn connection_lifetime(&self) -> Duration {
        Duration::from_millis(self.connection_lifetime_ms)
    }

    /// Acquire wait limit as a duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Connect and I/O deadline as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientConfig {
    /// Create a configuration for the given servers with default pool
    /// settings.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            pool: PoolSettings::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one server endpoint is required".to_string(),
            ));
        }

        for server in &self.servers {
            EndPoint::parse(server)?;
        }

        if self.pool.max_pool_size < 1 {
            return Err(ConfigError::ValidationError(
                "max_pool_size must be greater or equal to 1".to_string(),
            ));
        }

        if self.pool.min_pool_size > self.pool.max_pool_size {
            return Err(ConfigError::ValidationError(
                "min_pool_size must not exceed max_pool_size".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse the seed list into endpoint values.
    pub fn endpoints(&self) -> Result<Vec<EndPoint>, ConfigError> {
        self.servers.iter().map(|s| EndPoint::parse(s)).collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_config() -> ClientConfig {
        ClientConfig::new(vec!["db1.example.com".to_string(), "db2:27018".to_string()])
    }

    #[test]
    fn test_default_config_validates() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_pool_size, 100);
        assert_eq!(config.pool.min_pool_size, 0);
        assert_eq!(config.pool.connection_timeout(), Duration::from_secs(15));
        assert_eq!(config.pool.connection_lifetime(), Duration::ZERO);
    }

    #[test]
    fn test_validation_requires_servers() {
        let config = ClientConfig::new(vec![]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let config = ClientConfig::new(vec!["db1:notaport".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_max_pool_size() {
        let mut config = test_config();
        config.pool.max_pool_size = 0;
        let error = config.validate().unwrap_err();
        assert_eq!(
            error.to_string(),
            "Validation error: max_pool_size must be greater or equal to 1"
        );
    }

    #[test]
    fn test_validation_rejects_min_above_max() {
        let mut config = test_config();
        config.pool.min_pool_size = 10;
        config.pool.max_pool_size = 5;
        let error = config.validate().unwrap_err();
        assert_eq!(
            error.to_string(),
            "Validation error: min_pool_size must not exceed max_pool_size"
        );
    }

    #[test]
    fn test_endpoints_parse_with_default_port() {
        let config = test_config();
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints[0], EndPoint::new("db1.example.com", 27017));
        assert_eq!(endpoints[1], EndPoint::new("db2", 27018));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = test_config();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.servers, config.servers);
    }

    #[test]
    fn test_config_file_operations() {
        let config = test_config();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.servers, config.servers);
        assert_eq!(loaded.pool.max_pool_size, config.pool.max_pool_size);
    }

    #[test]
    fn test_pool_settings_default_when_missing() {
        let parsed: ClientConfig = toml::from_str("servers = [\"db1:27017\"]").unwrap();
        assert_eq!(parsed.pool.max_pool_size, 100);
        assert!(parsed.validate().is_ok());
    }
}
