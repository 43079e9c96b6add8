//! Configuration management for Tollgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables prefixed with `TOLLGATE` (nested keys use `__`,
//! e.g. `TOLLGATE_ENGINE__STORE_TIMEOUT_MS=25`).

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Main configuration for the Tollgate engine and binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// What to do with a rule whose counter store call failed or timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Treat the rule as non-restrictive for this request.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

/// Rate limiting engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Namespace prepended to every counter key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Upper bound for a single counter store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Behaviour when the counter store is unavailable
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Counter TTL as a multiple of the rule window (never below 2)
    #[serde(default = "default_ttl_multiplier")]
    pub ttl_multiplier: u32,

    /// Message used in 429 payloads when a rule has no custom message
    #[serde(default = "default_message")]
    pub default_message: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            store_timeout_ms: default_store_timeout_ms(),
            fail_mode: FailMode::default(),
            ttl_multiplier: default_ttl_multiplier(),
            default_message: default_message(),
        }
    }
}

impl EngineConfig {
    /// Timeout applied to every counter store call.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// TTL for counter state of a rule with the given window.
    pub fn ttl_for(&self, window_seconds: u64) -> Duration {
        let multiplier = u64::from(self.ttl_multiplier.max(MIN_TTL_MULTIPLIER));
        Duration::from_secs(window_seconds.max(1).saturating_mul(multiplier))
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(TollgateError::Config("engine.namespace must not be empty".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "engine.store_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

const MIN_TTL_MULTIPLIER: u32 = 2;

fn default_namespace() -> String {
    "ratelimit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_ttl_multiplier() -> u32 {
    MIN_TTL_MULTIPLIER
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file only, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load layered configuration: defaults, optional file, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("TOLLGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder
            .build()
            .map_err(|e| TollgateError::Config(format!("Failed to build configuration: {e}")))?
            .try_deserialize()
            .map_err(|e| {
                TollgateError::Config(format!("Failed to deserialize configuration: {e}"))
            })?;

        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.engine.namespace, "ratelimit");
        assert_eq!(config.engine.store_timeout(), Duration::from_millis(50));
        assert_eq!(config.engine.fail_mode, FailMode::Open);
        assert_eq!(config.logging.level, "info");
        assert!(config.rules_path.is_none());
    }

    #[test]
    fn test_ttl_is_at_least_twice_the_window() {
        let mut engine = EngineConfig::default();
        assert_eq!(engine.ttl_for(60), Duration::from_secs(120));

        engine.ttl_multiplier = 0;
        assert_eq!(engine.ttl_for(10), Duration::from_secs(20));

        engine.ttl_multiplier = 5;
        assert_eq!(engine.ttl_for(10), Duration::from_secs(50));
    }

    #[test]
    fn test_parse_yaml_with_partial_fields() {
        let yaml = r#"
engine:
  store_timeout_ms: 20
  fail_mode: closed
logging:
  json: true
rules_path: /etc/tollgate/rules.yaml
"#;
        let config: TollgateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.store_timeout_ms, 20);
        assert_eq!(config.engine.fail_mode, FailMode::Closed);
        assert_eq!(config.engine.namespace, "ratelimit");
        assert!(config.logging.json);
        assert_eq!(config.rules_path.as_deref(), Some("/etc/tollgate/rules.yaml"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let engine = EngineConfig {
            store_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(engine.validate(), Err(TollgateError::Config(_))));
    }

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tollgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_from_file() {
        let path = write_temp("engine:\n  namespace: edge\n  fail_mode: closed\n");
        let config = TollgateConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.engine.namespace, "edge");
        assert_eq!(config.engine.fail_mode, FailMode::Closed);
        assert_eq!(config.engine.store_timeout_ms, 50);
    }

    #[test]
    fn test_from_file_validates_engine() {
        let path = write_temp("engine:\n  store_timeout_ms: 0\n");
        let result = TollgateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let missing = std::env::temp_dir().join("tollgate-does-not-exist.yaml");
        assert!(matches!(TollgateConfig::from_file(missing), Err(TollgateError::Io(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TollgateConfig::load(None).unwrap();
        assert!(!config.engine.namespace.is_empty());
    }
}
