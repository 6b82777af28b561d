//! # LlamaKV
//!
//! Embeddable key-value store with pluggable persistence, eviction-policy
//! caches, TTL expiry and best-effort replication between nodes over HTTP.
//!
//! ## Features
//!
//! - Typed value envelopes (string, int, float, bytes, JSON, opaque) with TTL and metadata
//! - Namespaced keys
//! - LRU and nearest-expiry TTL cache strategies
//! - Memory, JSON file and RocksDB backends
//! - Lazy expiry on read plus periodic purge sweeps
//! - Asynchronous fire-and-forget replication with per-peer circuit breaking
//! - HTTP node surface with bearer auth, loop-guarded propagation and Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use llamakv::prelude::*;
//!
//! let store = Store::new(Box::new(MemoryBackend::new()), Box::new(LruCache::new(1000)?));
//! store.set_with("session:42", "alice", SetOptions::ttl(300))?;
//! assert_eq!(store.get("session:42")?, Some(Payload::from("alice")));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────┐   POST /propagate   ┌──────────────┐
//! │ caller   │──▶│ Store                 │────────────────────▶│ peer node    │
//! └──────────┘   │  ├─ cache (LRU / TTL) │  DistributedClient  │  Distributed │
//!                │  ├─ backend           │  (queue + worker)   │  Server      │
//!                │  └─ replicator        │                     │  └─ Store    │
//!                └───────────────────────┘                     └──────────────┘
//! ```

// Modules
pub mod backend;
pub mod cache;
pub mod config;
pub mod core;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod prelude;
pub mod store;

// Re-exports for convenience
pub use error::{KvError, Result, StorageError};
