//! Configuration loading using Figment.
//!
//! Configuration is assembled from (lowest to highest precedence):
//! 1. built-in defaults
//! 2. a TOML file
//! 3. environment variables prefixed with `REMOTE_DAQ_`, nested keys separated
//!    by a double underscore
//!
//! ```text
//! REMOTE_DAQ_LOGGING__LEVEL=debug
//! REMOTE_DAQ_SERVER__BIND_ADDRESS=0.0.0.0:7400
//! REMOTE_DAQ_CLIENT__INVOCATION_TIMEOUT_MS=2000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use remote_daq::config::RemoteConfig;
//!
//! let config = RemoteConfig::load_from("config/remote_daq.toml")?;
//! println!("serving on {}", config.server.bind_address);
//! # Ok::<(), remote_daq::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::limits::{DEFAULT_REPLY_CACHE_CAPACITY, MAX_FRAME_BYTES};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are not usable
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Server settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Client proxy defaults
    #[serde(default)]
    pub client: ClientSettings,
    /// Simulated instruments hosted by `remote_daq serve`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP address to listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Client proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Wait for the server to acquire the object and for the reply
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_ms: u64,
    /// Server-side bound on handler run time (none = unbounded)
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
    /// Noblock replies kept before the oldest is evicted
    #[serde(default = "default_reply_cache_capacity")]
    pub reply_cache_capacity: usize,
    /// Seconds an unread noblock reply is retained
    #[serde(default = "default_reply_cache_ttl")]
    pub reply_cache_ttl_secs: u64,
    /// Send requests for names missing from the loaded description
    #[serde(default)]
    pub allow_foreign_attributes: bool,
}

/// Simulated instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Ids of simulated energy meters to host
    #[serde(default = "default_energy_meters")]
    pub energy_meters: Vec<String>,
    /// Interval between simulated pulses while measuring
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}

fn default_invocation_timeout() -> u64 {
    5000
}

fn default_reply_cache_capacity() -> usize {
    DEFAULT_REPLY_CACHE_CAPACITY
}

fn default_reply_cache_ttl() -> u64 {
    60
}

fn default_energy_meters() -> Vec<String> {
    vec!["energy-meter".to_string()]
}

fn default_sample_interval() -> u64 {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: default_invocation_timeout(),
            execution_timeout_ms: None,
            reply_cache_capacity: default_reply_cache_capacity(),
            reply_cache_ttl_secs: default_reply_cache_ttl(),
            allow_foreign_attributes: false,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            energy_meters: default_energy_meters(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl ClientSettings {
    /// Invocation timeout as a `Duration`.
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// Execution timeout as a `Duration`.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    /// Noblock reply retention as a `Duration`.
    pub fn reply_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_cache_ttl_secs)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RemoteConfig {
    /// Environment variable prefix
    pub const ENV_PREFIX: &'static str = "REMOTE_DAQ_";

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(RemoteConfig::default()))
    }

    /// Load from defaults and environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment()
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then environment variables.
    ///
    /// A missing file is not an error; its values simply come from defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Self::figment().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `remote_daq config`).
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::ValidationError("server.bind_address is empty".into()));
        }
        if self.server.max_frame_bytes == 0 || self.server.max_frame_bytes > u32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "server.max_frame_bytes {} must be between 1 and {}",
                self.server.max_frame_bytes,
                u32::MAX
            )));
        }

        if self.client.invocation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "client.invocation_timeout_ms must be positive".into(),
            ));
        }
        if self.client.execution_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "client.execution_timeout_ms must be positive when set".into(),
            ));
        }
        if self.client.reply_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "client.reply_cache_capacity must be positive".into(),
            ));
        }
        if self.client.reply_cache_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "client.reply_cache_ttl_secs must be positive".into(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for id in &self.simulation.energy_meters {
            if !ids.insert(id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate simulated instrument id: '{}'",
                    id
                )));
            }
        }
        if self.simulation.sample_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "simulation.sample_interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = RemoteConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.reply_cache_capacity, 1024);
        assert_eq!(config.client.reply_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.server.max_frame_bytes, MAX_FRAME_BYTES);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RemoteConfig::from_toml_str(
            r#"
            [client]
            invocation_timeout_ms = 250
            execution_timeout_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.client.invocation_timeout(), Duration::from_millis(250));
        assert_eq!(config.client.execution_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RemoteConfig::from_toml_str("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = RemoteConfig::from_toml_str("[client]\nreply_cache_capacity = 0").unwrap_err();
        assert!(err.to_string().contains("reply_cache_capacity"));

        let err = RemoteConfig::from_toml_str("[simulation]\nenergy_meters = [\"a\", \"a\"]").unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_malformed_toml_is_load_error() {
        let err = RemoteConfig::from_toml_str("[client\n").unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    #[serial]
    fn test_file_and_env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nbind_address = \"0.0.0.0:9000\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        std::env::set_var("REMOTE_DAQ_LOGGING__LEVEL", "debug");
        let config = RemoteConfig::load_from(file.path());
        std::env::remove_var("REMOTE_DAQ_LOGGING__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:9000");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RemoteConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RemoteConfig::default());
    }

    #[test]
    fn test_toml_rendering_roundtrips() {
        let rendered = RemoteConfig::default().to_toml_string().unwrap();
        let parsed = RemoteConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, RemoteConfig::default());
    }
}
