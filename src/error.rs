//! Error types for LlamaKV

use thiserror::Error;

/// Main error type for LlamaKV
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Backend error: {0}")]
    Backend(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Memory limit exceeded: entry needs {needed} bytes, budget is {limit} bytes")]
    MemoryLimit { needed: usize, limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rust_rocksdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Value encoding error: {0}")]
    Encoding(String),

    #[error("Value decoding error: {0}")]
    Decoding(String),
}

impl From<serde_json::Error> for KvError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
