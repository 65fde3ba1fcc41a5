//! Fanout policy and dependency declarations

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling priority of a fanout (lower rank runs sooner)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl FanoutPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutPriority::Critical => "CRITICAL",
            FanoutPriority::High => "HIGH",
            FanoutPriority::Normal => "NORMAL",
            FanoutPriority::Low => "LOW",
            FanoutPriority::Background => "BACKGROUND",
        }
    }

    /// Outbox `priority` column value for entries emitted at this priority.
    pub fn outbox_priority(&self) -> i32 {
        match self {
            FanoutPriority::Critical => 10,
            FanoutPriority::High => 50,
            FanoutPriority::Normal => 100,
            FanoutPriority::Low => 200,
            FanoutPriority::Background => 500,
        }
    }
}

/// What to do when discovery finds more than `max_fanout` downstream entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerAction {
    /// Log and drop
    Skip,
    /// Abort the trigger with `FanoutLimitExceeded`
    Error,
    /// Hand off to a background outbox entry processed without the breaker
    #[default]
    Async,
}

/// Exponential backoff for failed batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`: `initial * multiplier^(attempt-1)`,
    /// capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Per-dependency fanout policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutPolicy {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub max_fanout: u64,
    pub circuit_breaker_action: CircuitBreakerAction,
    pub priority: FanoutPriority,
    pub retry: RetryConfig,
    pub deduplication_window_ms: u64,
    pub timeout_ms: u64,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_delay_ms: 10,
            max_fanout: 10_000,
            circuit_breaker_action: CircuitBreakerAction::Async,
            priority: FanoutPriority::Normal,
            retry: RetryConfig::default(),
            deduplication_window_ms: 1_000,
            timeout_ms: 300_000,
        }
    }
}

impl FanoutPolicy {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Engine-wide fanout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub enabled: bool,
    pub max_concurrent_fanouts: usize,
    /// Policy for dependencies that do not declare their own
    pub default_policy: FanoutPolicy,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_fanouts: 10,
            default_policy: FanoutPolicy::default(),
        }
    }
}

/// Where the index value used for discovery comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum IndexValueSource {
    /// The upstream entity key itself
    EntityKey,
    /// Scalar (or array of scalars) at a pointer in the upstream document
    Field(String),
}

/// "When an upstream entity changes, downstream entities indexed under
/// `index_type = value` must be recomputed."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutDependency {
    pub name: String,
    pub upstream_entity_type: String,
    pub downstream_entity_type: String,
    pub index_type: String,
    pub value_source: IndexValueSource,
    /// Only fire when one of these slice types is impacted; empty = any change
    #[serde(default)]
    pub trigger_slice_types: BTreeSet<String>,
    #[serde(default)]
    pub policy: Option<FanoutPolicy>,
}

impl FanoutDependency {
    pub fn new(
        name: impl Into<String>,
        upstream_entity_type: impl Into<String>,
        downstream_entity_type: impl Into<String>,
        index_type: impl Into<String>,
        value_source: IndexValueSource,
    ) -> Self {
        Self {
            name: name.into(),
            upstream_entity_type: upstream_entity_type.into(),
            downstream_entity_type: downstream_entity_type.into(),
            index_type: index_type.into(),
            value_source,
            trigger_slice_types: BTreeSet::new(),
            policy: None,
        }
    }

    pub fn on_slices<I, S>(mut self, slice_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_slice_types = slice_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: FanoutPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn fires_on(&self, impacted: &BTreeSet<String>) -> bool {
        if impacted.is_empty() {
            return false;
        }
        self.trigger_slice_types.is_empty()
            || self.trigger_slice_types.iter().any(|t| impacted.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 300,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(300));
        assert_eq!(retry.backoff_for(30), Duration::from_millis(300));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(FanoutPriority::Critical < FanoutPriority::Normal);
        assert!(FanoutPriority::Normal < FanoutPriority::Background);
        assert!(
            FanoutPriority::Critical.outbox_priority()
                < FanoutPriority::Background.outbox_priority()
        );
    }

    #[test]
    fn test_dependency_fires_on() {
        let dep = FanoutDependency::new(
            "brand-products",
            "BRAND",
            "PRODUCT",
            "brand",
            IndexValueSource::EntityKey,
        )
        .on_slices(["SUMMARY"]);
        assert!(dep.fires_on(&BTreeSet::from(["SUMMARY".to_string()])));
        assert!(!dep.fires_on(&BTreeSet::from(["DETAIL".to_string()])));
        assert!(!dep.fires_on(&BTreeSet::new()));
    }

    #[test]
    fn test_value_source_serde() {
        let src: IndexValueSource =
            serde_json::from_str(r#"{"kind":"field","path":"/brand/id"}"#).unwrap();
        assert_eq!(src, IndexValueSource::Field("/brand/id".into()));
        let key: IndexValueSource = serde_json::from_str(r#"{"kind":"entity_key"}"#).unwrap();
        assert_eq!(key, IndexValueSource::EntityKey);
    }
}
