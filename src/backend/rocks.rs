//! RocksDB backend
//!
//! Record format: [8 bytes: expire_at, unix millis LE, 0 = never][N bytes: JSON envelope]
//!
//! The fixed header lets the compaction filter drop expired rows without
//! parsing the envelope.

use super::{Backend, BackendStats, OpCounters};
use crate::StorageError;
use crate::config::RocksConfig;
use crate::core::{Key, Value, current_timestamp};
use rust_rocksdb::{
    BlockBasedOptions, CompactionDecision, DB, DBCompactionStyle, IteratorMode, LogLevel, Options,
    WriteOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Global counter for TTL compaction removals (accessible from compaction filter)
pub static TTL_COMPACTION_REMOVED: AtomicU64 = AtomicU64::new(0);

const HEADER_LEN: usize = 8;

/// RocksDB-backed persistence
pub struct RocksBackend {
    db: DB,
    write_opts: WriteOptions,
    counters: OpCounters,
}

impl RocksBackend {
    /// Open or create a RocksDB database at `path`
    pub fn open(path: impl AsRef<Path>, config: &RocksConfig) -> Result<Self, StorageError> {
        let path = path.as_ref();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_target_file_size_base(config.target_file_size_base);
        opts.set_compaction_style(DBCompactionStyle::Level);

        // RocksDB LOG file settings
        opts.set_log_level(parse_log_level(&config.log_level));
        opts.set_max_log_file_size(config.max_log_file_size);
        opts.set_keep_log_file_num(config.keep_log_file_num);

        if config.enable_compression {
            opts.set_compression_type(rust_rocksdb::DBCompressionType::Lz4);
        } else {
            opts.set_compression_type(rust_rocksdb::DBCompressionType::None);
        }

        let mut block_opts = BlockBasedOptions::default();
        let cache = rust_rocksdb::Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        block_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        if config.enable_ttl_compaction {
            opts.set_compaction_filter("ttl_filter", ttl_compaction_filter);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!("Failed to create directory: {e}"))
            })?;
        }

        let db = DB::open(&opts, path)?;

        info!(
            "RocksDB opened: path={:?}, block_cache={}MB, wal={}",
            path,
            config.block_cache_size / (1024 * 1024),
            !config.disable_wal,
        );

        let mut write_opts = WriteOptions::default();
        write_opts.disable_wal(config.disable_wal);

        Ok(Self {
            db,
            write_opts,
            counters: OpCounters::default(),
        })
    }
}

/// Encode a value as `[expire_at][envelope]`
pub fn encode_record(value: &Value) -> Result<Vec<u8>, StorageError> {
    let envelope = value
        .encode()
        .map_err(|e| StorageError::Encoding(e.to_string()))?;
    let expire_at = value.expiry().map_or(0, expiry_millis);

    let mut buf = Vec::with_capacity(HEADER_LEN + envelope.len());
    buf.extend_from_slice(&expire_at.to_le_bytes());
    buf.extend_from_slice(&envelope);
    Ok(buf)
}

/// Decode a record produced by [`encode_record`]
pub fn decode_record(bytes: &[u8]) -> Result<Value, StorageError> {
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::Decoding(
            "Record too short to decode".to_string(),
        ));
    }
    Value::decode(&bytes[HEADER_LEN..]).map_err(|e| StorageError::Decoding(e.to_string()))
}

/// Expiry timestamp rounded up to whole millis, never 0
fn expiry_millis(expiry: f64) -> u64 {
    ((expiry * 1000.0).ceil() as u64).max(1)
}

fn now_millis() -> u64 {
    (current_timestamp() * 1000.0) as u64
}

impl Backend for RocksBackend {
    fn name(&self) -> &'static str {
        "RocksBackend"
    }

    fn set(&self, key: &Key, value: &Value) -> Result<(), StorageError> {
        let record = encode_record(value)?;
        self.db
            .put_opt(key.as_str().as_bytes(), &record, &self.write_opts)?;
        self.counters.write();
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Value>, StorageError> {
        self.counters.read();
        match self.db.get(key.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Not atomic between the existence check and the delete; the store
    /// serializes mutations above this layer.
    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        let raw = key.as_str().as_bytes();
        let existed = self.db.get(raw)?.is_some();
        self.db.delete_opt(raw, &self.write_opts)?;
        if existed {
            self.counters.delete();
        }
        Ok(existed)
    }

    fn exists(&self, key: &Key) -> Result<bool, StorageError> {
        Ok(self.db.get(key.as_str().as_bytes())?.is_some())
    }

    fn keys(&self) -> Result<Vec<Key>, StorageError> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (raw, _) = item?;
            let canonical = std::str::from_utf8(&raw)
                .map_err(|e| StorageError::Decoding(format!("non-UTF-8 key: {e}")))?;
            keys.push(Key::parse(canonical));
        }
        Ok(keys)
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut removed = 0usize;
        for item in self.db.iterator(IteratorMode::Start) {
            let (raw, _) = item?;
            self.db.delete_opt(&raw, &self.write_opts)?;
            removed += 1;
        }
        info!(removed, "RocksDB cleared");
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        let keys = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .unwrap_or(None)
            .unwrap_or(0) as usize;
        self.counters.snapshot(self.name(), keys)
    }
}

fn parse_log_level(level: &str) -> LogLevel {
    match level.to_lowercase().as_str() {
        "debug" => LogLevel::Debug,
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "fatal" => LogLevel::Fatal,
        "header" => LogLevel::Header,
        _ => LogLevel::Error, // "error" or any unknown value
    }
}

/// TTL compaction filter - removes expired records during compaction
fn ttl_compaction_filter(_level: u32, _key: &[u8], value: &[u8]) -> CompactionDecision {
    if value.len() >= HEADER_LEN {
        let expire_at = u64::from_le_bytes(value[0..HEADER_LEN].try_into().unwrap_or([0; 8]));

        if expire_at != 0 && now_millis() > expire_at {
            TTL_COMPACTION_REMOVED.fetch_add(1, Ordering::Relaxed);
            return CompactionDecision::Remove;
        }
    }
    CompactionDecision::Keep
}
