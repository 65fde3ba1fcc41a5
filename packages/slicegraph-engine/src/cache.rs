//! Contract cache and single-flight loader
//!
//! `TtlLruCache` is a bounded true-LRU map whose entries also expire after a
//! TTL. An expired entry found by `get` is removed and counted as one
//! eviction and one miss. Load errors are never cached.
//!
//! `ContractLoader` puts a per-key async mutex in front of the registry so
//! that concurrent misses on one key trigger exactly one load; waiters
//! re-read the cache once they hold the lock. The lock map is itself a
//! `TtlLruCache`, so it stays bounded.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::contract::{ContractRegistry, RuleSetContract, RuleSetRef};
use crate::error::Result;

/// Cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlLruCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self::build(max_entries, ttl, true)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::build(config.max_entries, config.ttl(), config.enabled)
    }

    /// Every `get` misses and `put` stores nothing.
    pub fn disabled() -> Self {
        Self::build(1, Duration::ZERO, false)
    }

    fn build(max_entries: usize, ttl: Duration, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl
    }

    /// Counted lookup; refreshes recency on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.lookup(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Lookup without touching hit/miss counters (expiry still evicts).
    pub fn peek_fresh(&self, key: &K) -> Option<V> {
        self.lookup(key)
    }

    fn lookup(&self, key: &K) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some(entry) if !self.is_expired(entry, now) => return Some(entry.value.clone()),
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn put(&self, key: K, value: V) {
        if !self.enabled {
            return;
        }
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Return the fresh value for `key`, inserting `make()` under the same
    /// lock when absent or expired. Disabled caches always return `make()`.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, make: F) -> V {
        if !self.enabled {
            return make();
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            if !self.is_expired(entry, now) {
                return entry.value.clone();
            }
        }
        let value = make();
        let entry = CacheEntry {
            value: value.clone(),
            inserted_at: now,
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        value
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-flight
// ═══════════════════════════════════════════════════════════════════════════

/// Per-key async mutexes, bounded by TTL + LRU
pub struct SingleFlight<K: Hash + Eq> {
    locks: TtlLruCache<K, Arc<tokio::sync::Mutex<()>>>,
}

impl<K: Hash + Eq + Clone> SingleFlight<K> {
    pub fn new(max_keys: usize, ttl: Duration) -> Self {
        Self {
            locks: TtlLruCache::new(max_keys, ttl),
        }
    }

    pub fn lock_for(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .get_or_insert_with(key.clone(), || Arc::new(tokio::sync::Mutex::new(())))
    }

    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Contract loader
// ═══════════════════════════════════════════════════════════════════════════

pub struct ContractLoader {
    registry: Arc<dyn ContractRegistry>,
    cache: TtlLruCache<RuleSetRef, Arc<RuleSetContract>>,
    flights: SingleFlight<RuleSetRef>,
}

impl ContractLoader {
    pub fn new(registry: Arc<dyn ContractRegistry>, config: &CacheConfig) -> Self {
        let lock_ttl = config.ttl().max(Duration::from_secs(1));
        Self {
            registry,
            cache: TtlLruCache::from_config(config),
            flights: SingleFlight::new(config.max_entries, lock_ttl),
        }
    }

    /// Cached contract, loading (and validating) it at most once per miss.
    pub async fn load(&self, reference: &RuleSetRef) -> Result<Arc<RuleSetContract>> {
        if let Some(contract) = self.cache.get(reference) {
            return Ok(contract);
        }

        let lock = self.flights.lock_for(reference);
        let _guard = lock.lock().await;

        if let Some(contract) = self.cache.peek_fresh(reference) {
            return Ok(contract);
        }

        debug!(rule_set = %reference, "loading rule set contract");
        let contract = self.registry.load_rule_set_contract(reference).await?;
        contract.validate()?;
        self.cache.put(reference.clone(), contract.clone());
        Ok(contract)
    }

    pub fn invalidate(&self, reference: &RuleSetRef) -> bool {
        self.cache.invalidate(reference)
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_counts_one_eviction_and_miss() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"a"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn test_lru_bound_evicts_least_recent() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(3, Duration::from_secs(60));
        for i in 0..3 {
            cache.put(i, i);
        }
        // Touch 0 so 1 becomes least recently used
        assert_eq!(cache.get(&0), Some(0));
        cache.put(3, 3);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&0), Some(0));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_is_not_eviction() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(1, 2);
        assert_eq!(cache.get(&1), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::disabled();
        cache.put(1, 1);
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            evictions: 0,
            size: 1,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_single_flight_same_key_same_lock() {
        let flights: SingleFlight<String> = SingleFlight::new(2, Duration::from_secs(60));
        let a = flights.lock_for(&"k".to_string());
        let b = flights.lock_for(&"k".to_string());
        assert!(Arc::ptr_eq(&a, &b));

        flights.lock_for(&"x".to_string());
        flights.lock_for(&"y".to_string());
        assert_eq!(flights.tracked_keys(), 2);
    }
}
