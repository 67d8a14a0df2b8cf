//! Bridge configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vw_data::ConverterOptions;

use crate::router::RetryPolicy;

/// Environment variable overriding the lookup interval (`50ms`, `1s`, ...)
pub const ENV_LOOKUP_INTERVAL: &str = "VW_LOOKUP_INTERVAL";

/// Environment variable overriding the lookup attempt budget
pub const ENV_LOOKUP_ATTEMPTS: &str = "VW_LOOKUP_ATTEMPTS";

/// Environment variable toggling string predicates (`true` / `false`)
pub const ENV_TRUST_STRING_PREDICATES: &str = "VW_TRUST_STRING_PREDICATES";

/// Errors loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {name}: {message}")]
    Override { name: &'static str, message: String },
}

/// Bridge-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Target lookup settings for inbound commands
    pub lookup: LookupConfig,

    /// Whether commands run the view's render step when `run` is omitted
    pub run_by_default: bool,

    /// Payload conversion settings
    pub converter: ConverterOptions,
}

/// Target lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Delay between lookups of a not-yet-registered target
    pub interval_ms: u64,

    /// Lookups attempted before giving up with `UnknownTarget`
    pub max_attempts: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            // 5 seconds at the default interval
            max_attempts: 100,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            lookup: LookupConfig::default(),
            run_by_default: true,
            converter: ConverterOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_LOOKUP_INTERVAL) {
            let interval = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Override {
                name: ENV_LOOKUP_INTERVAL,
                message: e.to_string(),
            })?;
            self.lookup.interval_ms = interval.as_millis() as u64;
        }

        if let Some(raw) = lookup(ENV_LOOKUP_ATTEMPTS) {
            self.lookup.max_attempts = raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Override {
                name: ENV_LOOKUP_ATTEMPTS,
                message: e.to_string(),
            })?;
        }

        if let Some(raw) = lookup(ENV_TRUST_STRING_PREDICATES) {
            self.converter.trust_string_predicates = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::Override {
                        name: ENV_TRUST_STRING_PREDICATES,
                        message: format!("expected a boolean, got '{}'", other),
                    })
                }
            };
        }

        Ok(())
    }

    /// Retry policy for the inbound router
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.lookup.interval_ms),
            max_attempts: self.lookup.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.run_by_default);
        assert!(config.converter.trust_string_predicates);
        assert_eq!(config.retry_policy().interval, Duration::from_millis(50));
        assert_eq!(config.retry_policy().max_attempts, 100);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"lookup": {"max_attempts": 3}}"#).unwrap();
        assert_eq!(config.lookup.max_attempts, 3);
        assert_eq!(config.lookup.interval_ms, 50);
        assert!(config.run_by_default);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_LOOKUP_INTERVAL, "250ms"),
            (ENV_LOOKUP_ATTEMPTS, "7"),
            (ENV_TRUST_STRING_PREDICATES, "off"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.retry_policy().interval, Duration::from_millis(250));
        assert_eq!(config.lookup.max_attempts, 7);
        assert!(!config.converter.trust_string_predicates);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_LOOKUP_INTERVAL).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { name: ENV_LOOKUP_INTERVAL, .. }));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("vw-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"run_by_default": false}"#).unwrap();
        let config = BridgeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(!config.run_by_default);
    }
}
