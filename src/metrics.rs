//! Prometheus metrics for LlamaKV

use crate::backend::TTL_COMPACTION_REMOVED;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide metrics, shared by the store, the peer client and the server
pub struct Metrics {
    pub registry: Registry,

    // Store operations
    pub store_gets: IntCounter,
    pub store_sets: IntCounter,
    pub store_deletes: IntCounter,

    // Cache hit/miss counters
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,

    // Expired keys removed by reads or purge sweeps
    pub expired_removed: IntCounter,

    // Replication
    pub propagations_sent: IntCounter,
    pub propagations_failed: IntCounter,
    pub propagations_dropped: IntCounter,

    // HTTP surface
    pub http_requests: IntCounter,
    pub http_errors: IntCounter,
    pub http_unauthorized: IntCounter,
    pub request_latency: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let store_gets = counter(&registry, "llamakv_store_get_total", "Total store reads");
        let store_sets = counter(&registry, "llamakv_store_set_total", "Total store writes");
        let store_deletes =
            counter(&registry, "llamakv_store_delete_total", "Total store deletes");

        let cache_hits = counter(&registry, "llamakv_cache_hits_total", "Total cache hits");
        let cache_misses =
            counter(&registry, "llamakv_cache_misses_total", "Total cache misses");

        let expired_removed = counter(
            &registry,
            "llamakv_expired_keys_removed_total",
            "Keys removed by read-triggered expiry or purge sweeps",
        );

        let propagations_sent = counter(
            &registry,
            "llamakv_propagations_sent_total",
            "Updates delivered to at least one peer",
        );
        let propagations_failed = counter(
            &registry,
            "llamakv_propagations_failed_total",
            "Updates no peer accepted",
        );
        let propagations_dropped = counter(
            &registry,
            "llamakv_propagations_dropped_total",
            "Updates dropped because the queue was full",
        );

        let http_requests =
            counter(&registry, "llamakv_http_requests_total", "Total HTTP requests");
        let http_errors = counter(
            &registry,
            "llamakv_http_errors_total",
            "HTTP requests answered with a 5xx status",
        );
        let http_unauthorized = counter(
            &registry,
            "llamakv_http_unauthorized_total",
            "HTTP requests rejected by the bearer token check",
        );

        let request_latency = Histogram::with_opts(
            HistogramOpts::new(
                "llamakv_request_latency_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();
        registry.register(Box::new(request_latency.clone())).unwrap();

        Self {
            registry,
            store_gets,
            store_sets,
            store_deletes,
            cache_hits,
            cache_misses,
            expired_removed,
            propagations_sent,
            propagations_failed,
            propagations_dropped,
            http_requests,
            http_errors,
            http_unauthorized,
            request_latency,
        }
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        let mut output = String::from_utf8_lossy(&buffer).into_owned();

        // Compaction filter removals (static counter, RocksDB backend only)
        let compaction_removed = TTL_COMPACTION_REMOVED.load(Ordering::Relaxed);
        output.push_str(&format!(
            "\n# HELP llamakv_ttl_compaction_removed_total Records removed by TTL compaction filter\n\
             # TYPE llamakv_ttl_compaction_removed_total counter\n\
             llamakv_ttl_compaction_removed_total {compaction_removed}\n"
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Lightweight atomic counters backing the JSON `/stats` endpoint
#[derive(Default)]
pub struct AtomicCounters {
    pub requests: AtomicU64,
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub propagations_received: AtomicU64,
    pub propagations_skipped: AtomicU64,
    pub errors: AtomicU64,
    pub unauthorized: AtomicU64,
}

/// Point-in-time copy of [`AtomicCounters`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub propagations_received: u64,
    pub propagations_skipped: u64,
    pub errors: u64,
    pub unauthorized: u64,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_gets(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sets(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_deletes(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_propagations_received(&self) {
        self.propagations_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_propagations_skipped(&self) {
        self.propagations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            propagations_received: self.propagations_received.load(Ordering::Relaxed),
            propagations_skipped: self.propagations_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.store_gets.inc();
        metrics.store_sets.inc();
        metrics.cache_hits.inc();
        metrics.request_latency.observe(0.002);

        let output = metrics.gather();
        assert!(output.contains("llamakv_store_get_total 1"));
        assert!(output.contains("llamakv_request_latency_seconds"));
        assert!(output.contains("llamakv_ttl_compaction_removed_total"));
    }

    #[test]
    fn test_atomic_counters() {
        let counters = AtomicCounters::new();
        counters.inc_gets();
        counters.inc_gets();
        counters.inc_propagations_skipped();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.gets, 2);
        assert_eq!(snapshot.propagations_skipped, 1);
        assert_eq!(snapshot.requests, 0);
    }
}
