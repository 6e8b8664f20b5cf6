//! Result caches for downstream services.
//!
//! Semantic repair and translation results are cached by normalized input
//! text and model version. Entries expire after `ttl_ms` and the least
//! recently used entry is evicted once the cache is full.

use crate::clock::{Clock, elapsed_ms};
use crate::defaults;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::CACHE_CAPACITY,
            ttl_ms: defaults::CACHE_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub normalized_text: String,
    pub model_version: String,
}

impl CacheKey {
    pub fn new(text: &str, model_version: impl Into<String>) -> Self {
        Self {
            normalized_text: normalize_text(text),
            model_version: model_version.into(),
        }
    }
}

/// Trims, collapses runs of whitespace to one space and lowercases.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_access: u64,
}

struct Inner<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    tick: u64,
}

impl<V> Inner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct ResultCache<V> {
    config: CacheConfig,
    inner: Mutex<Inner<V>>,
    clock: Arc<dyn Clock>,
    pub stats: CacheStats,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(config.capacity),
                tick: 0,
            }),
            config,
            clock,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if elapsed_ms(entry.inserted_at, now) < self.config.ttl_ms => {
                entry.last_access = tick;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: CacheKey, value: V) {
        if self.config.capacity == 0 {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.capacity {
            self.purge_expired(&mut inner, now);
            if inner.entries.len() >= self.config.capacity {
                let lru = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(k, _)| k.clone());
                if let Some(lru) = lru {
                    inner.entries.remove(&lru);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_access: tick,
            },
        );
    }

    fn purge_expired(&self, inner: &mut Inner<V>, now: Instant) -> usize {
        let ttl_ms = self.config.ttl_ms;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| elapsed_ms(entry.inserted_at, now) < ttl_ms);
        let removed = before - inner.entries.len();
        self.stats
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner, now)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn cache(clock: &MockClock, capacity: usize) -> ResultCache<String> {
        ResultCache::new(
            CacheConfig {
                capacity,
                ttl_ms: 1000,
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_keys_normalize_whitespace_and_case() {
        assert_eq!(
            CacheKey::new("  Hello   World\n", "v1"),
            CacheKey::new("hello world", "v1")
        );
        assert_ne!(CacheKey::new("hello", "v1"), CacheKey::new("hello", "v2"));
    }

    #[test]
    fn test_hit_and_miss_are_counted() {
        let clock = MockClock::new();
        let c = cache(&clock, 4);
        assert!(c.get(&CacheKey::new("hi", "v1")).is_none());
        c.insert(CacheKey::new("hi", "v1"), "salut".into());
        assert_eq!(c.get(&CacheKey::new("HI ", "v1")), Some("salut".into()));

        let stats = c.stats.snapshot();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let clock = MockClock::new();
        let c = cache(&clock, 4);
        c.insert(CacheKey::new("a", "v1"), "x".into());
        clock.advance_ms(999);
        assert!(c.get(&CacheKey::new("a", "v1")).is_some());
        clock.advance_ms(1);
        assert!(c.get(&CacheKey::new("a", "v1")).is_none());
        assert!(c.is_empty());
        assert_eq!(c.stats.snapshot().expirations, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let clock = MockClock::new();
        let c = cache(&clock, 2);
        c.insert(CacheKey::new("a", "v1"), "1".into());
        c.insert(CacheKey::new("b", "v1"), "2".into());
        assert!(c.get(&CacheKey::new("a", "v1")).is_some());

        c.insert(CacheKey::new("c", "v1"), "3".into());

        assert_eq!(c.len(), 2);
        assert!(c.get(&CacheKey::new("b", "v1")).is_none());
        assert!(c.get(&CacheKey::new("a", "v1")).is_some());
        assert_eq!(c.stats.snapshot().evictions, 1);
    }

    #[test]
    fn test_full_cache_prefers_dropping_expired_entries() {
        let clock = MockClock::new();
        let c = cache(&clock, 2);
        c.insert(CacheKey::new("old", "v1"), "1".into());
        clock.advance_ms(600);
        c.insert(CacheKey::new("new", "v1"), "2".into());
        clock.advance_ms(500);

        c.insert(CacheKey::new("newest", "v1"), "3".into());

        assert!(c.get(&CacheKey::new("new", "v1")).is_some());
        assert_eq!(c.stats.snapshot().evictions, 0);
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let clock = MockClock::new();
        let c = cache(&clock, 0);
        c.insert(CacheKey::new("a", "v1"), "1".into());
        assert!(c.is_empty());
    }
}
