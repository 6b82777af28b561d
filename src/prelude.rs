//! Prelude module for common imports.
//!
//! This module re-exports commonly used types and traits for convenience.
//!
//! # Usage
//!
//! ```ignore
//! use llamakv::prelude::*;
//! ```

// Error types
pub use crate::error::{KvError, Result, StorageError};

// Configuration
pub use crate::config::{
    BackendConfig, BackendKind, CacheConfig, CacheKind, Config, DistributedConfig, ServerConfig,
    StoreConfig,
};

// Key and value model
pub use crate::core::{Key, Metadata, Payload, Value, ValueType};

// Caches and backends
pub use crate::backend::{Backend, FileBackend, MemoryBackend, RocksBackend};
pub use crate::cache::{CacheStrategy, LruCache, TtlCache, TtlCacheSettings};

// Store
pub use crate::store::{KeyFilter, SetOptions, Store, StoreListener, Transaction};

// Replication
pub use crate::distributed::{DistributedClient, DistributedServer, Mutation, Replicator};

// Metrics
pub use crate::metrics::Metrics;

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
