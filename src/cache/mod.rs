//! In-process cache strategies
//!
//! A cache is a bounded, volatile overlay over the backend. Every strategy
//! guards its state with a single lock, since even reads mutate it (LRU
//! recency order, TTL cleanup sweeps).

mod lru;
mod ttl;

pub use self::lru::LruCache;
pub use self::ttl::{ENTRY_OVERHEAD, TtlCache, TtlCacheSettings};

use crate::config::{CacheConfig, CacheKind};
use crate::core::{Key, Value};
use serde::Serialize;
use std::time::Duration;

/// Cache strategy used as the store's read/write-through layer
pub trait CacheStrategy: Send + Sync {
    /// Strategy name for stats and logs
    fn name(&self) -> &'static str;

    /// Look up a key. Never returns an expired value; expired entries are
    /// dropped as a side effect.
    fn get(&self, key: &Key) -> Option<Value>;

    /// Insert or replace an entry, evicting according to the policy
    fn set(&self, key: Key, value: Value) -> crate::Result<()>;

    /// Remove a key. Returns `true` if it was cached.
    fn delete(&self, key: &Key) -> bool;

    fn clear(&self);

    /// Number of cached entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub capacity: usize,
    pub size: usize,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub inserts: u64,
    pub evictions: u64,
    pub expires: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanups: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<usize>,
}

/// Plain counters shared by the strategies (always mutated under the cache lock)
#[derive(Debug, Default, Clone)]
pub(crate) struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expires: u64,
    pub cleanups: u64,
}

impl CacheCounters {
    pub(crate) fn snapshot(&self, kind: &'static str, capacity: usize, size: usize) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            kind,
            capacity,
            size,
            utilization: percent(size as f64, capacity as f64),
            hits: self.hits,
            misses: self.misses,
            hit_rate: percent(self.hits as f64, total as f64),
            inserts: self.inserts,
            evictions: self.evictions,
            expires: self.expires,
            ..CacheStats::default()
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

/// Build the cache strategy described by `config`
pub fn build_cache(config: &CacheConfig) -> crate::Result<Box<dyn CacheStrategy>> {
    Ok(match config.kind {
        CacheKind::Lru => Box::new(LruCache::new(config.capacity)?),
        CacheKind::Ttl => Box::new(TtlCache::new(TtlCacheSettings {
            capacity: config.capacity,
            default_ttl: (config.default_ttl_secs > 0).then_some(config.default_ttl_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            max_size_bytes: config.max_size_bytes,
        })?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_config() {
        let mut config = CacheConfig::default();
        assert_eq!(build_cache(&config).unwrap().name(), "LRUCache");

        config.kind = CacheKind::Ttl;
        let cache = build_cache(&config).unwrap();
        assert_eq!(cache.name(), "TTLCache");
        assert_eq!(cache.stats().default_ttl, Some(300));

        config.capacity = 0;
        assert!(build_cache(&config).is_err());
    }

    #[test]
    fn test_snapshot_rates() {
        let counters = CacheCounters {
            hits: 3,
            misses: 1,
            ..CacheCounters::default()
        };
        let stats = counters.snapshot("X", 10, 5);
        assert!((stats.hit_rate - 75.0).abs() < f64::EPSILON);
        assert!((stats.utilization - 50.0).abs() < f64::EPSILON);

        let empty = CacheCounters::default().snapshot("X", 10, 0);
        assert!(empty.hit_rate.abs() < f64::EPSILON);
    }
}
