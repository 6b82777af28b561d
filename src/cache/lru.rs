//! Least-recently-used cache strategy

use super::{CacheCounters, CacheStats, CacheStrategy};
use crate::KvError;
use crate::core::{Key, Value};
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Fixed-capacity cache evicting in strict recency order
pub struct LruCache {
    capacity: usize,
    ttl_check: bool,
    inner: Mutex<LruInner>,
}

struct LruInner {
    entries: ::lru::LruCache<Key, Value>,
    counters: CacheCounters,
}

enum Lookup {
    Miss,
    Expired,
    Hit(Value),
}

impl LruCache {
    /// Create an LRU cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> crate::Result<Self> {
        Self::with_ttl_check(capacity, true)
    }

    /// Create an LRU cache, optionally skipping expiry checks on `get`
    pub fn with_ttl_check(capacity: usize, ttl_check: bool) -> crate::Result<Self> {
        let cap = NonZeroUsize::new(capacity)
            .ok_or_else(|| KvError::Config("LRU cache capacity must be at least 1".to_string()))?;
        Ok(Self {
            capacity,
            ttl_check,
            inner: Mutex::new(LruInner {
                entries: ::lru::LruCache::new(cap),
                counters: CacheCounters::default(),
            }),
        })
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn evict_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<Key> = inner
            .entries
            .iter()
            .filter(|(_, value)| value.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.counters.expires += expired.len() as u64;
        expired.len()
    }
}

impl CacheStrategy for LruCache {
    fn name(&self) -> &'static str {
        "LRUCache"
    }

    fn get(&self, key: &Key) -> Option<Value> {
        let mut inner = self.inner.lock();

        // `get` promotes the entry to most-recently-used
        let lookup = match inner.entries.get(key) {
            None => Lookup::Miss,
            Some(value) if self.ttl_check && value.is_expired() => Lookup::Expired,
            Some(value) => Lookup::Hit(value.clone()),
        };

        match lookup {
            Lookup::Miss => {
                inner.counters.misses += 1;
                None
            }
            Lookup::Expired => {
                inner.entries.pop(key);
                inner.counters.expires += 1;
                inner.counters.misses += 1;
                None
            }
            Lookup::Hit(value) => {
                inner.counters.hits += 1;
                Some(value)
            }
        }
    }

    fn set(&self, key: Key, value: Value) -> crate::Result<()> {
        let mut inner = self.inner.lock();

        if !inner.entries.contains(&key) && inner.entries.len() >= self.capacity {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                inner.counters.evictions += 1;
                tracing::trace!(key = %evicted, "LRU eviction");
            }
        }

        inner.entries.put(key, value);
        inner.counters.inserts += 1;
        Ok(())
    }

    fn delete(&self, key: &Key) -> bool {
        self.inner.lock().entries.pop(key).is_some()
    }

    fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        inner
            .counters
            .snapshot(self.name(), self.capacity, inner.entries.len())
    }
}
