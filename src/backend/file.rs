//! Flat JSON file backend
//!
//! The whole map lives in memory and is written out as a single JSON object
//! of `canonical key -> value envelope`. Writes go to a sibling temp file that
//! is renamed over the target, so a crash never leaves a truncated file.

use super::{Backend, BackendStats, OpCounters};
use crate::StorageError;
use crate::core::{Key, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

pub struct FileBackend {
    path: PathBuf,
    sync_on_write: bool,
    data: RwLock<HashMap<Key, Value>>,
    dirty: AtomicBool,
    counters: OpCounters,
}

impl FileBackend {
    /// Open `path`, loading its contents if the file exists
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!("Failed to create directory: {e}"))
            })?;
        }

        let data = if path.exists() {
            load(&path)?
        } else {
            HashMap::new()
        };

        info!(path = ?path, keys = data.len(), "File backend opened");

        Ok(Self {
            path,
            sync_on_write,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            counters: OpCounters::default(),
        })
    }

    /// Write the current map to disk
    pub fn sync(&self) -> Result<(), StorageError> {
        self.persist(&self.data.read())
    }

    fn persist(&self, data: &HashMap<Key, Value>) -> Result<(), StorageError> {
        let mut document = serde_json::Map::with_capacity(data.len());
        for (key, value) in data {
            let structured = value
                .to_structured()
                .map_err(|e| StorageError::Encoding(format!("{key}: {e}")))?;
            document.insert(key.as_str().to_string(), structured);
        }
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty.store(false, Ordering::Release);

        debug!(path = ?self.path, keys = data.len(), "File backend synced");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` under the write lock. With `sync_on_write` a failed
    /// sync puts the previous map back, so memory never runs ahead of disk.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<Key, Value>) -> T,
    ) -> Result<T, StorageError> {
        let mut data = self.data.write();
        if !self.sync_on_write {
            let out = change(&mut data);
            self.dirty.store(true, Ordering::Release);
            return Ok(out);
        }

        let previous = data.clone();
        let out = change(&mut data);
        if let Err(e) = self.persist(&data) {
            *data = previous;
            error!(path = ?self.path, "Sync failed, write rolled back: {}", e);
            return Err(e);
        }
        Ok(out)
    }
}

fn load(path: &Path) -> Result<HashMap<Key, Value>, StorageError> {
    let bytes = std::fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }

    let document: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::Decoding(format!("{}: {e}", path.display())))?;

    document
        .into_iter()
        .map(|(key, raw)| {
            let value = Value::from_structured(&raw)
                .map_err(|e| StorageError::Decoding(format!("{key}: {e}")))?;
            Ok((Key::parse(&key), value))
        })
        .collect()
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "FileBackend"
    }

    fn set(&self, key: &Key, value: &Value) -> Result<(), StorageError> {
        self.mutate(|data| {
            data.insert(key.clone(), value.clone());
        })?;
        self.counters.write();
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Value>, StorageError> {
        self.counters.read();
        Ok(self.data.read().get(key).cloned())
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        if !self.data.read().contains_key(key) {
            return Ok(false);
        }
        let existed = self.mutate(|data| data.remove(key).is_some())?;
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
        self.mutate(HashMap::clear)
    }

    fn stats(&self) -> BackendStats {
        self.counters.snapshot(self.name(), self.data.read().len())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire)
            && let Err(e) = self.sync()
        {
            error!(path = ?self.path, "Failed to flush file backend: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("data.json");

        {
            let backend = FileBackend::open(&path, true).unwrap();
            backend
                .set(&Key::with_namespace("1", "users"), &Value::new("alice"))
                .unwrap();
            backend
                .set(&Key::new("doc"), &Value::new(json!({"a": [1, 2]})).with_ttl(Some(60)))
                .unwrap();
        }

        let backend = FileBackend::open(&path, true).unwrap();
        let user = backend.get(&Key::parse("users:1")).unwrap().unwrap();
        assert_eq!(user.payload().as_str(), Some("alice"));
        let doc = backend.get(&Key::new("doc")).unwrap().unwrap();
        assert_eq!(doc.payload().as_json(), Some(&json!({"a": [1, 2]})));
        assert_eq!(doc.ttl(), Some(60));
        assert_eq!(backend.keys().unwrap().len(), 2);
    }

    #[test]
    fn test_deferred_sync_flushes_on_drop() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("nested").join("data.json");

        {
            let backend = FileBackend::open(&path, false).unwrap();
            backend.set(&Key::new("k"), &Value::new(1i64)).unwrap();
            assert!(!path.exists());
        }

        let backend = FileBackend::open(&path, false).unwrap();
        assert!(backend.exists(&Key::new("k")).unwrap());
    }

    #[test]
    fn test_delete_and_clear_persist() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("data.json");
        let backend = FileBackend::open(&path, true).unwrap();

        backend.set(&Key::new("a"), &Value::new("1")).unwrap();
        backend.set(&Key::new("b"), &Value::new("2")).unwrap();
        assert!(backend.delete(&Key::new("a")).unwrap());
        assert!(!backend.delete(&Key::new("a")).unwrap());
        drop(backend);

        let backend = FileBackend::open(&path, true).unwrap();
        assert_eq!(backend.keys().unwrap(), vec![Key::new("b")]);
        backend.clear().unwrap();
        drop(backend);

        let backend = FileBackend::open(&path, true).unwrap();
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn test_failed_sync_rolls_back() {
        let tmp_dir = TempDir::new().unwrap();
        let dir = tmp_dir.path().join("sub");
        let path = dir.join("data.json");
        let backend = FileBackend::open(&path, true).unwrap();
        backend.set(&Key::new("a"), &Value::new("1")).unwrap();

        std::fs::remove_dir_all(&dir).unwrap();

        assert!(backend.set(&Key::new("a"), &Value::new("2")).is_err());
        assert!(backend.set(&Key::new("b"), &Value::new("3")).is_err());
        assert!(backend.delete(&Key::new("a")).is_err());
        assert!(backend.clear().is_err());

        let a = backend.get(&Key::new("a")).unwrap().unwrap();
        assert_eq!(a.payload().as_str(), Some("1"));
        assert!(!backend.exists(&Key::new("b")).unwrap());
        assert_eq!(backend.keys().unwrap(), vec![Key::new("a")]);
        assert_eq!(backend.stats().writes, 1);
        assert_eq!(backend.stats().deletes, 0);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("data.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileBackend::open(&path, true),
            Err(StorageError::Decoding(_))
        ));

        std::fs::write(&path, b"  \n").unwrap();
        assert!(FileBackend::open(&path, true).unwrap().keys().unwrap().is_empty());
    }
}
