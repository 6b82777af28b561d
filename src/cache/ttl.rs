//! TTL cache strategy with nearest-expiry eviction
//!
//! Entries that arrive without a TTL are stamped with the cache's default.
//! When the cache is full, the entry that will expire soonest is evicted, not
//! the least recently used one. An optional byte budget is enforced after
//! every insert using the same ordering.

use super::{CacheCounters, CacheStats, CacheStrategy};
use crate::KvError;
use crate::core::{Key, Value, current_timestamp};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Fixed per-entry bookkeeping overhead added to the byte estimate
pub const ENTRY_OVERHEAD: usize = 64;

/// Construction parameters for [`TtlCache`]
#[derive(Debug, Clone)]
pub struct TtlCacheSettings {
    pub capacity: usize,
    /// TTL (seconds) stamped on values that carry none
    pub default_ttl: Option<u64>,
    /// Minimum time between full expiry sweeps triggered by `get`
    pub cleanup_interval: Duration,
    /// Byte budget for the estimated footprint
    pub max_size_bytes: Option<usize>,
}

impl Default for TtlCacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Some(300),
            cleanup_interval: Duration::from_secs(60),
            max_size_bytes: None,
        }
    }
}

struct TtlEntry {
    value: Value,
    size: usize,
}

struct TtlInner {
    entries: HashMap<Key, TtlEntry>,
    counters: CacheCounters,
    bytes: usize,
    last_cleanup: Instant,
}

impl TtlInner {
    fn remove(&mut self, key: &Key) -> Option<TtlEntry> {
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Key of the entry expiring soonest, ignoring `skip`
    fn soonest_expiry(&self, skip: Option<&Key>) -> Option<Key> {
        self.entries
            .iter()
            .filter(|(key, _)| skip != Some(*key))
            .min_by(|a, b| eviction_order(a, b))
            .map(|(key, _)| key.clone())
    }

    fn sweep(&mut self, now: f64) -> usize {
        let expired: Vec<Key> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.value.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.counters.expires += expired.len() as u64;
        self.counters.cleanups += 1;
        self.last_cleanup = Instant::now();
        expired.len()
    }
}

/// Ascending expiry (no TTL sorts last), then creation time, then key
fn eviction_order(a: &(&Key, &TtlEntry), b: &(&Key, &TtlEntry)) -> Ordering {
    let expiry = |e: &TtlEntry| e.value.expiry().unwrap_or(f64::INFINITY);
    expiry(a.1)
        .total_cmp(&expiry(b.1))
        .then_with(|| a.1.value.created_at().total_cmp(&b.1.value.created_at()))
        .then_with(|| a.0.cmp(b.0))
}

/// Capacity- and size-bounded cache evicting by nearest expiry
pub struct TtlCache {
    settings: TtlCacheSettings,
    inner: Mutex<TtlInner>,
}

impl TtlCache {
    pub fn new(settings: TtlCacheSettings) -> crate::Result<Self> {
        if settings.capacity == 0 {
            return Err(KvError::Config(
                "TTL cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            settings,
            inner: Mutex::new(TtlInner {
                entries: HashMap::new(),
                counters: CacheCounters::default(),
                bytes: 0,
                last_cleanup: Instant::now(),
            }),
        })
    }

    /// Remove every expired entry now. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.inner.lock().sweep(current_timestamp());
        if removed > 0 {
            tracing::debug!(removed, "TTL cache cleanup");
        }
        removed
    }

    /// Current byte estimate of all entries
    pub fn estimated_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    fn entry_size(key: &Key, value: &Value) -> usize {
        key.len() + value.estimated_size() + ENTRY_OVERHEAD
    }
}

impl CacheStrategy for TtlCache {
    fn name(&self) -> &'static str {
        "TTLCache"
    }

    fn get(&self, key: &Key) -> Option<Value> {
        let mut inner = self.inner.lock();
        let now = current_timestamp();

        if inner.last_cleanup.elapsed() >= self.settings.cleanup_interval {
            inner.sweep(now);
        }

        let expired = match inner.entries.get(key) {
            None => {
                inner.counters.misses += 1;
                return None;
            }
            Some(entry) => entry.value.is_expired_at(now),
        };

        if expired {
            inner.remove(key);
            inner.counters.expires += 1;
            inner.counters.misses += 1;
            return None;
        }

        inner.counters.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    fn set(&self, key: Key, value: Value) -> crate::Result<()> {
        let value = match (value.ttl(), self.settings.default_ttl) {
            (None, Some(default)) => value.with_ttl(Some(default)),
            _ => value,
        };
        let size = Self::entry_size(&key, &value);

        if let Some(limit) = self.settings.max_size_bytes
            && size > limit
        {
            return Err(KvError::MemoryLimit {
                needed: size,
                limit,
            });
        }

        let mut inner = self.inner.lock();

        if inner.remove(&key).is_none()
            && inner.entries.len() >= self.settings.capacity
            && let Some(victim) = inner.soonest_expiry(None)
        {
            inner.remove(&victim);
            inner.counters.evictions += 1;
            tracing::trace!(key = %victim, "TTL cache capacity eviction");
        }

        inner.bytes += size;
        inner.entries.insert(key.clone(), TtlEntry { value, size });
        inner.counters.inserts += 1;

        if let Some(limit) = self.settings.max_size_bytes {
            while inner.bytes > limit {
                let Some(victim) = inner.soonest_expiry(Some(&key)) else {
                    break;
                };
                inner.remove(&victim);
                inner.counters.evictions += 1;
                tracing::trace!(key = %victim, bytes = inner.bytes, "TTL cache size eviction");
            }
        }

        Ok(())
    }

    fn delete(&self, key: &Key) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            cleanups: Some(inner.counters.cleanups),
            default_ttl: self.settings.default_ttl,
            estimated_size_bytes: Some(inner.bytes),
            max_size_bytes: self.settings.max_size_bytes,
            ..inner
                .counters
                .snapshot(self.name(), self.settings.capacity, inner.entries.len())
        }
    }
}
