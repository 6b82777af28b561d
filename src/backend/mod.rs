//! Persistence backends
//!
//! A backend is the durable source of truth under the store's cache. It only
//! moves envelopes in and out; expiry decisions belong to the store.

mod file;
mod memory;
mod rocks;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, TTL_COMPACTION_REMOVED, decode_record, encode_record};

use crate::StorageError;
use crate::config::{BackendConfig, BackendKind};
use crate::core::{Key, Value};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable key-value storage consumed by the store
pub trait Backend: Send + Sync {
    /// Backend name for stats and logs
    fn name(&self) -> &'static str;

    fn set(&self, key: &Key, value: &Value) -> Result<(), StorageError>;

    fn get(&self, key: &Key) -> Result<Option<Value>, StorageError>;

    /// Remove a key. Returns `true` if it existed.
    fn delete(&self, key: &Key) -> Result<bool, StorageError>;

    fn exists(&self, key: &Key) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Every stored key, including expired ones
    fn keys(&self) -> Result<Vec<Key>, StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn stats(&self) -> BackendStats;
}

/// Backend statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub keys: usize,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Operation counters shared by the backends
#[derive(Debug, Default)]
pub(crate) struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, kind: &'static str, keys: usize) -> BackendStats {
        BackendStats {
            kind,
            keys,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Open the backend described by `config`
pub fn build_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, StorageError> {
    Ok(match config.kind {
        BackendKind::Memory => Box::new(MemoryBackend::new()),
        BackendKind::File => Box::new(FileBackend::open(&config.path, config.sync_on_write)?),
        BackendKind::RocksDb => Box::new(RocksBackend::open(&config.path, &config.rocksdb)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_each_kind() {
        let tmp_dir = TempDir::new().unwrap();
        let mut config = BackendConfig::default();
        assert_eq!(build_backend(&config).unwrap().name(), "MemoryBackend");

        config.kind = BackendKind::File;
        config.path = tmp_dir.path().join("store.json");
        assert_eq!(build_backend(&config).unwrap().name(), "FileBackend");

        config.kind = BackendKind::RocksDb;
        config.path = tmp_dir.path().join("rocks");
        config.rocksdb.block_cache_size = 8 * 1024 * 1024;
        assert_eq!(build_backend(&config).unwrap().name(), "RocksBackend");
    }
}
