//! Resilience configuration.
//!
//! Values are resolved in three layers: built-in defaults, an optional JSON
//! file, then `QAHT_*` environment variables.
//!
//! | Option | Env var | Default |
//! |--------|---------|---------|
//! | `failure_threshold` | `QAHT_FAILURE_THRESHOLD` | 5 |
//! | `recovery_timeout_secs` | `QAHT_RECOVERY_TIMEOUT_SECS` | 60 |
//! | `default_delay_secs` | `QAHT_DEFAULT_DELAY_SECS` | 1.0 |
//! | `min_delay_secs` | `QAHT_MIN_DELAY_SECS` | 0.05 |
//! | `max_delay_secs` | `QAHT_MAX_DELAY_SECS` | 60 |
//! | `cache_ttl_secs` | `QAHT_CACHE_TTL_SECS` | 3600 |
//! | `max_retries` | `QAHT_MAX_RETRIES` | 3 |
//! | `base_delay_secs` | `QAHT_BASE_DELAY_SECS` | 1.0 |
//! | `backoff_factor` | `QAHT_BACKOFF_FACTOR` | 2.0 |

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Every tunable of the resilience layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures that trip a breaker.
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    /// Initial pacing delay for endpoints without an entry in `endpoint_delays`.
    pub default_delay_secs: f64,
    pub min_delay_secs: f64,
    /// Ceiling on self-imposed delay growth.
    pub max_delay_secs: f64,
    pub success_threshold: u32,
    pub shrink_factor: f64,
    pub error_growth_factor: f64,
    pub rate_limit_growth_factor: f64,
    pub cache_ttl_secs: u64,
    /// Total attempts per call, the first one included.
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub backoff_factor: f64,
    pub max_backoff_secs: f64,
    pub jitter: bool,
    pub endpoint_delays: BTreeMap<String, f64>,
    /// Latency samples kept per operation for percentile figures.
    pub latency_window: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            default_delay_secs: 1.0,
            min_delay_secs: 0.05,
            max_delay_secs: 60.0,
            success_threshold: 10,
            shrink_factor: 0.9,
            error_growth_factor: 1.5,
            rate_limit_growth_factor: 2.0,
            cache_ttl_secs: 3_600,
            max_retries: 3,
            base_delay_secs: 1.0,
            backoff_factor: 2.0,
            max_backoff_secs: 60.0,
            jitter: false,
            endpoint_delays: BTreeMap::new(),
            latency_window: 1_024,
        }
    }
}

impl ResilienceConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `QAHT_*` overrides resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "QAHT_FAILURE_THRESHOLD", &mut self.failure_threshold)?;
        override_from(
            &lookup,
            "QAHT_RECOVERY_TIMEOUT_SECS",
            &mut self.recovery_timeout_secs,
        )?;
        override_from(&lookup, "QAHT_DEFAULT_DELAY_SECS", &mut self.default_delay_secs)?;
        override_from(&lookup, "QAHT_MIN_DELAY_SECS", &mut self.min_delay_secs)?;
        override_from(&lookup, "QAHT_MAX_DELAY_SECS", &mut self.max_delay_secs)?;
        override_from(&lookup, "QAHT_CACHE_TTL_SECS", &mut self.cache_ttl_secs)?;
        override_from(&lookup, "QAHT_MAX_RETRIES", &mut self.max_retries)?;
        override_from(&lookup, "QAHT_BASE_DELAY_SECS", &mut self.base_delay_secs)?;
        override_from(&lookup, "QAHT_BACKOFF_FACTOR", &mut self.backoff_factor)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(String::from(
                "failure_threshold must be at least 1",
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(String::from(
                "max_retries must be at least 1",
            )));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "shrink_factor must be in (0, 1], got {}",
                self.shrink_factor
            )));
        }
        if self.error_growth_factor < 1.0 || self.rate_limit_growth_factor < 1.0 {
            return Err(ConfigError::Invalid(String::from(
                "growth factors must be >= 1.0",
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(String::from(
                "backoff_factor must be >= 1.0",
            )));
        }
        let delays = [
            self.recovery_timeout_secs,
            self.default_delay_secs,
            self.min_delay_secs,
            self.max_delay_secs,
            self.base_delay_secs,
            self.max_backoff_secs,
        ];
        if delays.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return Err(ConfigError::Invalid(String::from(
                "durations must be finite and non-negative",
            )));
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "min_delay_secs ({}) exceeds max_delay_secs ({})",
                self.min_delay_secs, self.max_delay_secs
            )));
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn override_from<T, F>(lookup: &F, name: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(());
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value: raw })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = ResilienceConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_factor, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let vars: HashMap<&str, &str> = [
            ("QAHT_FAILURE_THRESHOLD", "3"),
            ("QAHT_CACHE_TTL_SECS", " 60 "),
        ]
        .into_iter()
        .collect();
        let mut config = ResilienceConfig::default();
        config
            .apply_env(|name| vars.get(name).map(|value| value.to_string()))
            .expect("overrides parse");

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn malformed_env_value_is_rejected() {
        let mut config = ResilienceConfig::default();
        let error = config
            .apply_env(|name| (name == "QAHT_MAX_RETRIES").then(|| String::from("many")))
            .expect_err("non-numeric retries should fail");
        assert!(matches!(
            error,
            ConfigError::InvalidEnv {
                name: "QAHT_MAX_RETRIES",
                ..
            }
        ));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("qaht.json");
        fs::write(
            &path,
            r#"{"failure_threshold": 2, "endpoint_delays": {"reddit/search": 2.0}}"#,
        )
        .expect("write config");

        let config = ResilienceConfig::from_file(&path).expect("config parses");
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.endpoint_delays.get("reddit/search"), Some(&2.0));
        assert_eq!(config.cache_ttl_secs, 3_600);
    }

    #[test]
    fn validation_rejects_inverted_delay_bounds() {
        let config = ResilienceConfig {
            min_delay_secs: 5.0,
            max_delay_secs: 1.0,
            ..ResilienceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
