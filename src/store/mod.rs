//! Store orchestrator
//!
//! The [`Store`] owns one durable [`Backend`] and one volatile
//! [`CacheStrategy`]. Writes go to the backend first, then the cache; reads
//! try the cache and fall back to the backend with a refill. Every operation
//! runs under a single re-entrant lock, so a read that hits an expired
//! envelope can delete it on the same thread.
//!
//! When a [`Replicator`] is attached, local mutations are handed to it after
//! they succeed locally. Replication outcome never fails the local call.

mod transaction;

pub use transaction::Transaction;

use crate::KvError;
use crate::backend::{Backend, BackendStats, build_backend};
use crate::cache::{CacheStats, CacheStrategy, build_cache};
use crate::config::Config;
use crate::core::{Key, Metadata, Payload, Value, current_timestamp};
use crate::distributed::{Mutation, Replicator};
use crate::metrics::Metrics;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug, info, warn};

/// Observer of applied mutations, driven by the store
///
/// Callbacks run under the store lock, after the backend and cache agree.
pub trait StoreListener: Send + Sync {
    fn on_set(&self, _key: &Key, _value: &Value) {}

    fn on_delete(&self, _key: &Key) {}

    fn on_clear(&self) {}
}

/// Per-write options
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL in seconds; falls back to the store default
    pub ttl: Option<u64>,
    pub metadata: Metadata,
}

impl SetOptions {
    pub fn ttl(ttl: u64) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Key listing filter: optional namespace and regex (searched in the canonical key)
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    namespace: Option<String>,
    pattern: Option<Regex>,
}

impl KeyFilter {
    /// Match every key
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn pattern(mut self, pattern: &str) -> crate::Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| KvError::Validation(format!("invalid key pattern: {e}")))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    pub fn matches(&self, key: &Key) -> bool {
        if let Some(ns) = &self.namespace
            && key.namespace() != Some(ns.as_str())
        {
            return false;
        }
        self.pattern
            .as_ref()
            .is_none_or(|regex| regex.is_match(key.as_str()))
    }
}

/// Store statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_keys: usize,
    pub key_types: BTreeMap<&'static str, usize>,
    pub namespaces: BTreeMap<String, usize>,
    pub expired_keys: usize,
    pub backend: BackendStats,
    pub cache: CacheStats,
    pub distributed: bool,
    pub auto_purge: bool,
    pub purge_interval: u64,
    pub last_purge: f64,
}

/// Namespace bucket for keys without one
pub const DEFAULT_NAMESPACE: &str = "__default__";

/// Key-value store over one backend and one cache
pub struct Store {
    backend: Box<dyn Backend>,
    cache: Box<dyn CacheStrategy>,
    replicator: Option<Arc<dyn Replicator>>,
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
    metrics: Option<Arc<Metrics>>,
    lock: ReentrantMutex<()>,
    default_ttl: Option<u64>,
    auto_purge: bool,
    purge_interval: Duration,
    /// Unix timestamp of the last purge sweep (construction time initially)
    last_purge: Mutex<f64>,
    span: Span,
}

impl Store {
    pub fn new(backend: Box<dyn Backend>, cache: Box<dyn CacheStrategy>) -> Self {
        let span = tracing::info_span!("store", backend = backend.name(), cache = cache.name());
        Self {
            backend,
            cache,
            replicator: None,
            listeners: RwLock::new(Vec::new()),
            metrics: None,
            lock: ReentrantMutex::new(()),
            default_ttl: None,
            auto_purge: true,
            purge_interval: Duration::from_secs(60),
            last_purge: Mutex::new(current_timestamp()),
            span,
        }
    }

    /// Build backend, cache and store settings from `config`
    pub fn from_config(config: &Config) -> crate::Result<Self> {
        let backend = build_backend(&config.backend)?;
        let cache = build_cache(&config.cache)?;
        let store = Self::new(backend, cache)
            .with_default_ttl(config.store.default_ttl_secs)
            .with_auto_purge(config.store.auto_purge_expired, config.store.purge_interval());

        info!(
            backend = store.backend.name(),
            cache = store.cache.name(),
            capacity = config.cache.capacity,
            "Store initialized"
        );
        Ok(store)
    }

    pub fn with_replicator(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<u64>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_auto_purge(mut self, enabled: bool, interval: Duration) -> Self {
        self.auto_purge = enabled;
        self.purge_interval = interval;
        self
    }

    /// Emit this store's events inside `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_distributed(&self) -> bool {
        self.replicator.is_some()
    }

    /// Store a payload with the default options
    pub fn set(&self, key: impl Into<Key>, payload: impl Into<Payload>) -> crate::Result<()> {
        self.set_with(key, payload, SetOptions::default())
    }

    /// Store a payload with an explicit TTL and metadata
    pub fn set_with(
        &self,
        key: impl Into<Key>,
        payload: impl Into<Payload>,
        options: SetOptions,
    ) -> crate::Result<()> {
        let value = Value::new(payload)
            .with_ttl(options.ttl.or(self.default_ttl))
            .with_metadata(options.metadata);
        self.set_value(key, value)
    }

    /// Store a prebuilt envelope as-is
    pub fn set_value(&self, key: impl Into<Key>, value: Value) -> crate::Result<()> {
        self.write(key.into(), value, true)
    }

    /// Payload for `key`, `None` when absent or expired
    pub fn get(&self, key: impl Into<Key>) -> crate::Result<Option<Payload>> {
        Ok(self.get_value(key, false)?.map(Value::into_payload))
    }

    /// Payload for `key`, or `default` when absent or expired
    pub fn get_or(
        &self,
        key: impl Into<Key>,
        default: impl Into<Payload>,
    ) -> crate::Result<Payload> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Payload for `key`, failing with `KeyNotFound` when absent or expired
    pub fn fetch(&self, key: impl Into<Key>) -> crate::Result<Payload> {
        let key = key.into();
        self.get(&key)?
            .ok_or_else(|| KvError::KeyNotFound(key.to_string()))
    }

    /// Full envelope for `key`
    ///
    /// Unless `include_expired` is set, an expired envelope is deleted
    /// (backend, cache and peers) and `None` is returned.
    pub fn get_value(
        &self,
        key: impl Into<Key>,
        include_expired: bool,
    ) -> crate::Result<Option<Value>> {
        let key = key.into();
        let _enter = self.span.enter();
        let _guard = self.lock.lock();

        self.maybe_purge();
        self.metric(|m| m.store_gets.inc());

        let value = match self.cache.get(&key) {
            Some(value) => {
                self.metric(|m| m.cache_hits.inc());
                Some(value)
            }
            None => {
                self.metric(|m| m.cache_misses.inc());
                let value = self.backend.get(&key)?;
                if let Some(v) = &value
                    && !v.is_expired()
                {
                    self.cache_put(&key, v)?;
                }
                value
            }
        };

        match value {
            Some(v) if !include_expired && v.is_expired() => {
                debug!(key = %key, "Read found expired key, removing");
                self.remove(&key, true)?;
                self.metric(|m| m.expired_removed.inc());
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Whether `key` holds a live value. Expired keys are removed.
    pub fn exists(&self, key: impl Into<Key>) -> crate::Result<bool> {
        Ok(self.get_value(key, false)?.is_some())
    }

    /// Delete `key` locally and on peers. Returns whether it existed locally.
    pub fn delete(&self, key: impl Into<Key>) -> crate::Result<bool> {
        let key = key.into();
        let _enter = self.span.enter();
        let _guard = self.lock.lock();
        self.remove(&key, true)
    }

    /// Live keys matching `filter`, sorted
    pub fn keys(&self, filter: &KeyFilter) -> crate::Result<Vec<Key>> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();
        self.maybe_purge();

        let mut keys = Vec::new();
        for key in self.backend.keys()? {
            if !filter.matches(&key) {
                continue;
            }
            if let Some(value) = self.backend.get(&key)?
                && !value.is_expired()
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn count(&self, filter: &KeyFilter) -> crate::Result<usize> {
        Ok(self.keys(filter)?.len())
    }

    /// Remove everything locally and on peers
    pub fn clear(&self) -> crate::Result<()> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();
        self.clear_local(true)
    }

    /// Delete every expired key. Returns the number purged.
    pub fn purge_expired(&self) -> crate::Result<usize> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();

        let now = current_timestamp();
        let mut purged = 0;
        for key in self.backend.keys()? {
            if let Some(value) = self.backend.get(&key)?
                && value.is_expired_at(now)
            {
                self.remove(&key, true)?;
                purged += 1;
            }
        }
        *self.last_purge.lock() = now;

        if purged > 0 {
            self.metric(|m| m.expired_removed.inc_by(purged as u64));
        }
        debug!(purged, "Purged expired keys");
        Ok(purged)
    }

    /// Begin a buffered batch of writes
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Run `f` against a transaction, committing on `Ok` and rolling back on `Err`
    pub fn with_transaction<T, F>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> crate::Result<T>,
    {
        let mut tx = self.transaction();
        match f(&mut tx) {
            Ok(result) => {
                if !tx.is_finalized() {
                    tx.commit()?;
                }
                Ok(result)
            }
            Err(e) => {
                if !tx.is_finalized() {
                    tx.rollback()?;
                }
                Err(e)
            }
        }
    }

    /// Apply a mutation received from a peer, without propagating it further
    pub fn apply(&self, mutation: Mutation) -> crate::Result<()> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();
        debug!(operation = ?mutation.operation(), key = ?mutation.key().map(Key::as_str), "Applying remote mutation");
        match mutation {
            Mutation::Set { key, value } => self.write(key, value, false),
            Mutation::Delete { key } => self.remove(&key, false).map(|_| ()),
            Mutation::Clear => self.clear_local(false),
        }
    }

    pub fn stats(&self) -> crate::Result<StoreStats> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();

        let now = current_timestamp();
        let keys = self.backend.keys()?;
        let mut key_types = BTreeMap::new();
        let mut namespaces = BTreeMap::new();
        let mut expired_keys = 0;

        for key in &keys {
            if let Some(value) = self.backend.get(key)? {
                *key_types.entry(value.value_type().as_str()).or_insert(0) += 1;
                if value.is_expired_at(now) {
                    expired_keys += 1;
                }
            }
            let namespace = key.namespace().unwrap_or(DEFAULT_NAMESPACE).to_string();
            *namespaces.entry(namespace).or_insert(0) += 1;
        }

        Ok(StoreStats {
            total_keys: keys.len(),
            key_types,
            namespaces,
            expired_keys,
            backend: self.backend.stats(),
            cache: self.cache.stats(),
            distributed: self.is_distributed(),
            auto_purge: self.auto_purge,
            purge_interval: self.purge_interval.as_secs(),
            last_purge: *self.last_purge.lock(),
        })
    }

    fn write(&self, key: Key, value: Value, propagate: bool) -> crate::Result<()> {
        let _enter = self.span.enter();
        let _guard = self.lock.lock();
        self.maybe_purge();

        self.backend.set(&key, &value)?;
        self.cache_put(&key, &value)?;
        self.metric(|m| m.store_sets.inc());

        for listener in self.listeners.read().iter() {
            listener.on_set(&key, &value);
        }
        debug!(key = %key, kind = value.value_type().as_str(), ttl = ?value.ttl(), "Set key");

        if propagate {
            self.replicate(Mutation::Set { key, value });
        }
        Ok(())
    }

    /// Delete from backend and cache. Caller holds the lock.
    fn remove(&self, key: &Key, propagate: bool) -> crate::Result<bool> {
        let existed = self.backend.delete(key)?;
        self.cache.delete(key);

        if existed {
            self.metric(|m| m.store_deletes.inc());
            for listener in self.listeners.read().iter() {
                listener.on_delete(key);
            }
        }
        debug!(key = %key, existed, "Delete key");

        if propagate {
            self.replicate(Mutation::Delete { key: key.clone() });
        }
        Ok(existed)
    }

    /// Caller holds the lock.
    fn clear_local(&self, propagate: bool) -> crate::Result<()> {
        self.backend.clear()?;
        self.cache.clear();

        for listener in self.listeners.read().iter() {
            listener.on_clear();
        }
        info!("Cleared all keys");

        if propagate {
            self.replicate(Mutation::Clear);
        }
        Ok(())
    }

    /// Refresh the cache copy. A value the cache cannot hold is dropped from
    /// the cache; the backend write stands.
    fn cache_put(&self, key: &Key, value: &Value) -> crate::Result<()> {
        match self.cache.set(key.clone(), value.clone()) {
            Ok(()) => Ok(()),
            Err(KvError::MemoryLimit { needed, limit }) => {
                self.cache.delete(key);
                warn!(key = %key, needed, limit, "Value exceeds cache budget, serving from backend");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn replicate(&self, mutation: Mutation) {
        if let Some(replicator) = &self.replicator {
            let operation = mutation.operation();
            if !replicator.propagate(mutation) {
                debug!(?operation, "Propagation not accepted");
            }
        }
    }

    /// Run a purge sweep when the interval has elapsed. Caller holds the lock.
    fn maybe_purge(&self) {
        if !self.auto_purge {
            return;
        }
        let due = {
            let mut last = self.last_purge.lock();
            let now = current_timestamp();
            if now - *last >= self.purge_interval.as_secs_f64() {
                *last = now;
                true
            } else {
                false
            }
        };
        if due && let Err(e) = self.purge_expired() {
            warn!("Expired key purge failed: {}", e);
        }
    }

    fn metric(&self, f: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use crate::cache::{LruCache, TtlCache, TtlCacheSettings};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn memory_store() -> Store {
        Store::new(
            Box::new(MemoryBackend::new()),
            Box::new(LruCache::new(100).unwrap()),
        )
    }

    /// Records every mutation handed to it
    #[derive(Default)]
    struct RecordingReplicator {
        seen: Mutex<Vec<Mutation>>,
    }

    impl Replicator for RecordingReplicator {
        fn propagate(&self, mutation: Mutation) -> bool {
            self.seen.lock().push(mutation);
            true
        }
    }

    #[derive(Default)]
    struct CountingListener {
        sets: AtomicUsize,
        deletes: AtomicUsize,
        clears: AtomicUsize,
    }

    impl StoreListener for CountingListener {
        fn on_set(&self, _key: &Key, _value: &Value) {
            self.sets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_delete(&self, _key: &Key) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_set_get_delete() {
        let store = memory_store();
        store.set("greeting", "hello").unwrap();
        store.set("answer", 42i64).unwrap();

        assert_eq!(store.get("greeting").unwrap(), Some(Payload::from("hello")));
        assert_eq!(store.get("answer").unwrap().and_then(|p| p.as_i64()), Some(42));
        assert!(store.exists("greeting").unwrap());

        assert!(store.delete("greeting").unwrap());
        assert!(!store.delete("greeting").unwrap());
        assert_eq!(store.get("greeting").unwrap(), None);
    }

    #[test]
    fn test_defaults_and_fetch() {
        let store = memory_store();
        assert_eq!(store.get_or("missing", "fallback").unwrap(), Payload::from("fallback"));
        assert!(matches!(store.fetch("missing"), Err(KvError::KeyNotFound(k)) if k == "missing"));

        store.set("present", 1.5f64).unwrap();
        assert_eq!(store.fetch("present").unwrap(), Payload::Float(1.5));
    }

    #[test]
    fn test_expired_read_removes_key() {
        let store = memory_store();
        store.set_with("x", "1", SetOptions::ttl(1)).unwrap();
        assert_eq!(store.get("x").unwrap(), Some(Payload::from("1")));
        assert_eq!(store.purge_expired().unwrap(), 0);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.get_or("x", "default").unwrap(), Payload::from("default"));
        assert!(!store.exists("x").unwrap());
    }

    #[test]
    fn test_purge_after_expiry() {
        let store = memory_store();
        store.set_with("x", "1", SetOptions::ttl(1)).unwrap();
        store.set("keep", "2").unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        assert!(store.purge_expired().unwrap() >= 1);
        assert_eq!(store.keys(&KeyFilter::all()).unwrap(), vec![Key::new("keep")]);
    }

    #[test]
    fn test_include_expired() {
        let store = memory_store();
        let stale = Value::new("old").with_created_at(1.0).with_ttl(Some(1));
        store.set_value("k", stale.clone()).unwrap();

        // backend copy is returned untouched
        assert_eq!(store.get_value("k", true).unwrap(), Some(stale));
        assert_eq!(store.get_value("k", false).unwrap(), None);
        assert_eq!(store.get_value("k", true).unwrap(), None);
    }

    #[test]
    fn test_cache_miss_falls_back_to_backend() {
        let store = Store::new(
            Box::new(MemoryBackend::new()),
            Box::new(LruCache::new(1).unwrap()),
        );
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap(); // evicts "a" from the cache only

        assert_eq!(store.get("a").unwrap(), Some(Payload::from("1")));
        let stats = store.stats().unwrap();
        assert_eq!(stats.cache.size, 1);
        assert_eq!(stats.total_keys, 2);
    }

    #[test]
    fn test_cache_memory_limit_keeps_backend_write() {
        let cache = TtlCache::new(TtlCacheSettings {
            capacity: 10,
            default_ttl: None,
            cleanup_interval: Duration::from_secs(3600),
            max_size_bytes: Some(80),
        })
        .unwrap();
        let store = Store::new(Box::new(MemoryBackend::new()), Box::new(cache));

        let large = "x".repeat(200);
        store.set("big", large.as_str()).unwrap();
        assert_eq!(store.stats().unwrap().cache.size, 0);
        assert_eq!(store.get("big").unwrap(), Some(Payload::from(large)));
    }

    #[test]
    fn test_default_ttl() {
        let store = memory_store().with_default_ttl(Some(120));
        store.set("a", "v").unwrap();
        store.set_with("b", "v", SetOptions::ttl(5)).unwrap();
        assert_eq!(store.get_value("a", false).unwrap().unwrap().ttl(), Some(120));
        assert_eq!(store.get_value("b", false).unwrap().unwrap().ttl(), Some(5));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let store = memory_store();
        let mut metadata = Metadata::new();
        metadata.insert("owner".to_string(), json!("ops"));
        store
            .set_with("doc", json!({"a": 1}), SetOptions::default().with_metadata(metadata))
            .unwrap();

        let value = store.get_value("doc", false).unwrap().unwrap();
        assert_eq!(value.metadata()["owner"], "ops");
        assert_eq!(value.payload().as_json(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_keys_with_filters() {
        let store = memory_store();
        store.set("users:1", "a").unwrap();
        store.set("users:2", "b").unwrap();
        store.set("orders:1", "c").unwrap();
        store.set("plain", "d").unwrap();
        store
            .set_value("users:old", Value::new("e").with_created_at(1.0).with_ttl(Some(1)))
            .unwrap();

        let users = store.keys(&KeyFilter::all().namespace("users")).unwrap();
        assert_eq!(users, vec![Key::parse("users:1"), Key::parse("users:2")]);

        let ones = KeyFilter::all().pattern(r":1$").unwrap();
        assert_eq!(store.count(&ones).unwrap(), 2);
        assert_eq!(store.count(&KeyFilter::all()).unwrap(), 4);

        assert!(matches!(
            KeyFilter::all().pattern("("),
            Err(KvError::Validation(_))
        ));
    }

    #[test]
    fn test_stats() {
        let store = memory_store();
        store.set("users:1", "a").unwrap();
        store.set("n", 1i64).unwrap();
        store
            .set_value("stale", Value::new(2i64).with_created_at(1.0).with_ttl(Some(1)))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.expired_keys, 1);
        assert_eq!(stats.key_types["IntValue"], 2);
        assert_eq!(stats.key_types["StringValue"], 1);
        assert_eq!(stats.namespaces["users"], 1);
        assert_eq!(stats.namespaces[DEFAULT_NAMESPACE], 2);
        assert!(!stats.distributed);
        assert_eq!(stats.backend.kind, "MemoryBackend");
        assert_eq!(stats.cache.kind, "LRUCache");
    }

    #[test]
    fn test_delete_metric_counts_removals() {
        let metrics = Arc::new(Metrics::new());
        let store = memory_store().with_metrics(Arc::clone(&metrics));

        assert!(!store.delete("missing").unwrap());
        assert_eq!(metrics.store_deletes.get(), 0);

        store.set("k", "v").unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert_eq!(metrics.store_deletes.get(), 1);
    }

    #[test]
    fn test_mutations_are_replicated() {
        let replicator = Arc::new(RecordingReplicator::default());
        let store = memory_store().with_replicator(replicator.clone());
        assert!(store.is_distributed());

        store.set("a", "1").unwrap();
        store.delete("a").unwrap();
        store.clear().unwrap();

        let seen = replicator.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], Mutation::Set { key, .. } if key.as_str() == "a"));
        assert!(matches!(&seen[1], Mutation::Delete { key } if key.as_str() == "a"));
        assert_eq!(seen[2], Mutation::Clear);
    }

    #[test]
    fn test_expired_read_propagates_delete() {
        let replicator = Arc::new(RecordingReplicator::default());
        let store = memory_store().with_replicator(replicator.clone());
        store
            .set_value("k", Value::new("v").with_created_at(1.0).with_ttl(Some(1)))
            .unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        let seen = replicator.seen.lock();
        assert!(matches!(seen.last(), Some(Mutation::Delete { key }) if key.as_str() == "k"));
    }

    #[test]
    fn test_apply_does_not_replicate() {
        let replicator = Arc::new(RecordingReplicator::default());
        let store = memory_store().with_replicator(replicator.clone());

        store
            .apply(Mutation::Set {
                key: Key::new("remote"),
                value: Value::new("v"),
            })
            .unwrap();
        assert_eq!(store.get("remote").unwrap(), Some(Payload::from("v")));
        store.apply(Mutation::Delete { key: Key::new("remote") }).unwrap();
        assert!(!store.exists("remote").unwrap());
        store.set("local", "x").unwrap();
        store.apply(Mutation::Clear).unwrap();
        assert_eq!(store.count(&KeyFilter::all()).unwrap(), 0);

        // only the local set went out
        assert_eq!(replicator.seen.lock().len(), 1);
    }

    #[test]
    fn test_listeners_driven_by_store() {
        let store = memory_store();
        let listener = Arc::new(CountingListener::default());
        store.add_listener(listener.clone());

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.delete("a").unwrap();
        store.delete("missing").unwrap();
        store.clear().unwrap();

        assert_eq!(listener.sets.load(Ordering::SeqCst), 2);
        assert_eq!(listener.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(listener.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_purge_on_interval() {
        let store = memory_store().with_auto_purge(true, Duration::ZERO);
        store
            .set_value("stale", Value::new("v").with_created_at(1.0).with_ttl(Some(1)))
            .unwrap();
        // any read sweeps the backend
        store.get("other").unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_keys, 0);
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(memory_store());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.set(format!("t{t}:{i}"), i64::from(i)).unwrap();
                        assert!(store.exists(format!("t{t}:{i}")).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.count(&KeyFilter::all()).unwrap(), 200);
        assert_eq!(store.count(&KeyFilter::all().namespace("t2")).unwrap(), 50);
    }

    #[test]
    fn test_from_config_file_backend() {
        let tmp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.backend.kind = crate::config::BackendKind::File;
        config.backend.path = tmp_dir.path().join("kv.json");

        {
            let store = Store::from_config(&config).unwrap();
            store.set("persisted", "yes").unwrap();
        }

        let backend = FileBackend::open(tmp_dir.path().join("kv.json"), true).unwrap();
        assert!(backend.exists(&Key::new("persisted")).unwrap());
    }
}
