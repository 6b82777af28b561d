//! In-memory backend

use super::{Backend, BackendStats, OpCounters};
use crate::StorageError;
use crate::core::{Key, Value};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Volatile backend over a locked `HashMap`
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<Key, Value>>,
    counters: OpCounters,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "MemoryBackend"
    }

    fn set(&self, key: &Key, value: &Value) -> Result<(), StorageError> {
        self.data.write().insert(key.clone(), value.clone());
        self.counters.write();
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Value>, StorageError> {
        self.counters.read();
        Ok(self.data.read().get(key).cloned())
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        let existed = self.data.write().remove(key).is_some();
        if existed {
            self.counters.delete();
        }
        Ok(existed)
    }

    fn exists(&self, key: &Key) -> Result<bool, StorageError> {
        Ok(self.data.read().contains_key(key))
    }

    fn keys(&self) -> Result<Vec<Key>, StorageError> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.data.write().clear();
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot(self.name(), self.data.read().len())
    }
}
