//! Engine configuration
//!
//! Loaded from YAML, then overridden by `SLICEGRAPH_*` environment
//! variables, then validated:
//!
//! ```yaml
//! outbox:
//!   visibility_timeout_secs: 300
//!   max_retries: 5
//! worker:
//!   batch_size: 50
//!   claim_strategy: ordered
//! cache:
//!   ttl_secs: 300
//! fanout:
//!   max_concurrent_fanouts: 10
//!   default_policy:
//!     max_fanout: 10000
//!     circuit_breaker_action: ASYNC
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::fanout::FanoutConfig;
use crate::worker::WorkerConfig;

pub const ENV_PREFIX: &str = "SLICEGRAPH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Invalid value for environment variable {var}: {value:?}")]
    Env { var: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Claims older than this are released by the maintenance sweep
    pub visibility_timeout_secs: u64,
    /// Failures before an entry moves to the DLQ
    pub max_retries: i32,
    pub maintenance_interval_ms: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            max_retries: 5,
            maintenance_interval_ms: 10_000,
        }
    }
}

impl OutboxSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub outbox: OutboxSettings,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub fanout: FanoutConfig,
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply `SLICEGRAPH_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a full variable name to
    /// its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&var).map(|value| (var, value))
        };

        if let Some(v) = get("OUTBOX_VISIBILITY_TIMEOUT_SECS") {
            self.outbox.visibility_timeout_secs = parse_env(v)?;
        }
        if let Some(v) = get("OUTBOX_MAX_RETRIES") {
            self.outbox.max_retries = parse_env(v)?;
        }
        if let Some(v) = get("WORKER_COUNT") {
            self.worker.workers = parse_env(v)?;
        }
        if let Some(v) = get("WORKER_BATCH_SIZE") {
            self.worker.batch_size = parse_env(v)?;
        }
        if let Some(v) = get("WORKER_POLL_INTERVAL_MS") {
            self.worker.poll_interval_ms = parse_env(v)?;
        }
        if let Some(v) = get("CACHE_ENABLED") {
            self.cache.enabled = parse_env(v)?;
        }
        if let Some(v) = get("CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse_env(v)?;
        }
        if let Some(v) = get("CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_env(v)?;
        }
        if let Some(v) = get("FANOUT_ENABLED") {
            self.fanout.enabled = parse_env(v)?;
        }
        if let Some(v) = get("FANOUT_MAX_CONCURRENT") {
            self.fanout.max_concurrent_fanouts = parse_env(v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.outbox.visibility_timeout_secs == 0 || self.outbox.visibility_timeout_secs > 86_400 {
            return Err(ConfigError::range_with_hint(
                "outbox.visibility_timeout_secs",
                self.outbox.visibility_timeout_secs,
                1,
                86_400,
                "Must exceed the longest expected processing time of one entry",
            ));
        }
        if !(1..=100).contains(&self.outbox.max_retries) {
            return Err(ConfigError::range_with_hint(
                "outbox.max_retries",
                self.outbox.max_retries,
                1,
                100,
                "Entries are dead-lettered after this many failures",
            ));
        }
        if self.worker.batch_size == 0 || self.worker.batch_size > 10_000 {
            return Err(ConfigError::range_with_hint(
                "worker.batch_size",
                self.worker.batch_size,
                1,
                10_000,
                "Entries claimed per poll",
            ));
        }
        if self.worker.workers == 0 || self.worker.workers > 1_024 {
            return Err(ConfigError::range_with_hint(
                "worker.workers",
                self.worker.workers,
                1,
                1_024,
                "Defaults to the number of CPUs",
            ));
        }
        if self.worker.max_backoff_ms < self.worker.poll_interval_ms {
            return Err(ConfigError::range_with_hint(
                "worker.max_backoff_ms",
                self.worker.max_backoff_ms,
                self.worker.poll_interval_ms,
                u64::MAX,
                "Backoff cap must not be below the poll interval",
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::range_with_hint(
                "cache.max_entries",
                self.cache.max_entries,
                1,
                usize::MAX,
                "Use enabled: false to turn the cache off",
            ));
        }
        if self.fanout.max_concurrent_fanouts == 0 {
            return Err(ConfigError::range_with_hint(
                "fanout.max_concurrent_fanouts",
                self.fanout.max_concurrent_fanouts,
                1,
                usize::MAX,
                "At least one fanout must be able to run",
            ));
        }
        let policy = &self.fanout.default_policy;
        if policy.batch_size == 0 {
            return Err(ConfigError::range_with_hint(
                "fanout.default_policy.batch_size",
                policy.batch_size,
                1,
                usize::MAX,
                "Downstream entities triggered per batch",
            ));
        }
        if policy.retry.max_attempts == 0 {
            return Err(ConfigError::range_with_hint(
                "fanout.default_policy.retry.max_attempts",
                policy.retry.max_attempts,
                1,
                u32::MAX,
                "Attempts include the first try",
            ));
        }
        if policy.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::range_with_hint(
                "fanout.default_policy.retry.backoff_multiplier",
                policy.retry.backoff_multiplier,
                1.0,
                f64::MAX,
                "Backoff must not shrink between attempts",
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>((var, value): (String, String)) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::CircuitBreakerAction;
    use crate::worker::ClaimStrategy;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.worker.workers >= 1);
    }

    #[test]
    fn test_yaml_partial_sections() {
        let yaml = r#"
outbox:
  max_retries: 3
worker:
  batch_size: 10
  claim_strategy: ordered_priority
fanout:
  default_policy:
    max_fanout: 500
    circuit_breaker_action: SKIP
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.outbox.max_retries, 3);
        assert_eq!(config.outbox.visibility_timeout_secs, 300);
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(config.worker.claim_strategy, ClaimStrategy::OrderedPriority);
        assert_eq!(config.fanout.default_policy.max_fanout, 500);
        assert_eq!(
            config.fanout.default_policy.circuit_breaker_action,
            CircuitBreakerAction::Skip
        );
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EngineConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("visibility_timeout_secs: 300"));
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_range_error() {
        let err = EngineConfig::from_yaml_str("worker:\n  batch_size: 0\n").unwrap_err();
        match err {
            ConfigError::Range { field, .. } => assert_eq!(field, "worker.batch_size"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SLICEGRAPH_CACHE_TTL_SECS", "60"),
            ("SLICEGRAPH_WORKER_COUNT", "3"),
            ("SLICEGRAPH_FANOUT_ENABLED", "false"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.worker.workers, 3);
        assert!(!config.fanout.enabled);
    }

    #[test]
    fn test_bad_override_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|name| (name == "SLICEGRAPH_OUTBOX_MAX_RETRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
