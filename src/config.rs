//! Configuration for LlamaKV

use crate::KvError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub backend: BackendConfig,
    pub distributed: DistributedConfig,
    pub metrics: MetricsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,

    /// Path prefix for every route (empty = mount at root)
    pub api_prefix: String,

    /// Identity of this node, used by the propagation loop guard
    pub node_id: Option<String>,

    /// Bearer token required on authenticated routes
    pub auth_token: Option<String>,

    /// Accept mutations pushed by peers on `/propagate`
    pub allow_propagation: bool,

    /// Header carrying the originating node id of a propagated mutation
    pub propagation_source_header: String,

    /// Emit a tracing span per HTTP request
    pub log_requests: bool,

    /// Number of Tokio worker threads (0 = number of CPUs)
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            api_prefix: "/api/v1".to_string(),
            node_id: None,
            auth_token: None,
            allow_propagation: true,
            propagation_source_header: "X-Propagation-Source".to_string(),
            log_requests: false,
            worker_threads: 0,
        }
    }
}

impl ServerConfig {
    /// Configured node id, or a generated `node-<pid>-<nanos>` one
    pub fn resolved_node_id(&self) -> String {
        match &self.node_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_node_id(),
        }
    }
}

fn generate_node_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("node-{}-{nanos}", std::process::id())
}

/// Store orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// TTL applied to sets that carry none (seconds)
    pub default_ttl_secs: Option<u64>,

    /// Opportunistically purge expired keys from the read/write path
    pub auto_purge_expired: bool,

    /// Minimum interval between opportunistic purges (seconds)
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: None,
            auto_purge_expired: true,
            purge_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Cache eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Lru,
    Ttl,
}

impl CacheKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lru" => Some(Self::Lru),
            "ttl" => Some(Self::Ttl),
            _ => None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub kind: CacheKind,

    /// Maximum number of cached entries
    pub capacity: usize,

    /// TTL cache only: TTL stamped on values without one (0 = none)
    pub default_ttl_secs: u64,

    /// TTL cache only: minimum interval between expiry sweeps
    pub cleanup_interval_secs: u64,

    /// TTL cache only: byte budget for the estimated footprint
    pub max_size_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Lru,
            capacity: 1000,
            default_ttl_secs: 300,
            cleanup_interval_secs: 60,
            max_size_bytes: None,
        }
    }
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    #[serde(alias = "rocks")]
    RocksDb,
}

impl BackendKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "file" => Some(Self::File),
            "rocksdb" | "rocks" => Some(Self::RocksDb),
            _ => None,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Data file (file backend) or directory (RocksDB)
    pub path: PathBuf,

    /// File backend: rewrite the file after every mutation
    pub sync_on_write: bool,

    /// RocksDB tuning
    pub rocksdb: RocksConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            path: PathBuf::from("./data/llamakv"),
            sync_on_write: true,
            rocksdb: RocksConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RocksConfig {
    /// Block cache size in bytes
    pub block_cache_size: usize,

    /// Write buffer size in bytes
    pub write_buffer_size: usize,

    /// Maximum number of write buffers
    pub max_write_buffer_number: i32,

    /// Target file size for level-1 in bytes
    pub target_file_size_base: u64,

    /// Maximum number of background jobs
    pub max_background_jobs: i32,

    /// Enable compression
    pub enable_compression: bool,

    /// Enable TTL compaction filter (runs during RocksDB compaction)
    pub enable_ttl_compaction: bool,

    /// Write-ahead log. Disabling it trades crash durability for write speed.
    pub disable_wal: bool,

    /// RocksDB LOG verbosity (debug, info, warn, error, fatal, header)
    pub log_level: String,

    pub max_log_file_size: usize,

    pub keep_log_file_num: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            block_cache_size: 256 * 1024 * 1024, // 256MB
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 3,
            target_file_size_base: 64 * 1024 * 1024, // 64MB
            max_background_jobs: 4,
            enable_compression: false,
            enable_ttl_compaction: true,
            disable_wal: false,
            log_level: "error".to_string(),
            max_log_file_size: 10 * 1024 * 1024,
            keep_log_file_num: 5,
        }
    }
}

/// Peer replication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Peer base URLs, `scheme://host:port` (empty = replication disabled).
    /// Peers are assumed to mount their routes under the local `api_prefix`.
    pub peers: Vec<String>,

    /// Attempts per peer before it is marked down
    pub retry_attempts: u32,

    /// Fixed sleep between attempts (milliseconds)
    pub retry_interval_ms: u64,

    pub connect_timeout_ms: u64,

    pub read_timeout_ms: u64,

    /// Queue updates for the background worker instead of sending inline
    pub async_updates: bool,

    /// Bound of the update queue; a full queue drops updates
    pub max_queue_size: usize,

    /// Fan each update out to all peers concurrently
    pub concurrent_fanout: bool,

    /// Bound on joining the worker at shutdown (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            retry_attempts: 3,
            retry_interval_ms: 5000,
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            async_updates: true,
            max_queue_size: 1000,
            concurrent_fanout: false,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl DistributedConfig {
    pub fn enabled(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose prometheus text on `{prefix}/metrics`
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KvError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| KvError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `LLAMAKV_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("LLAMAKV_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        if let Ok(id) = std::env::var("LLAMAKV_NODE_ID") {
            self.server.node_id = Some(id);
        }

        if let Ok(token) = std::env::var("LLAMAKV_AUTH_TOKEN") {
            self.server.auth_token = Some(token);
        }

        if let Ok(peers) = std::env::var("LLAMAKV_PEERS") {
            self.distributed.peers = parse_peers(&peers);
        }

        if let Ok(backend) = std::env::var("LLAMAKV_BACKEND")
            && let Some(kind) = BackendKind::parse(&backend)
        {
            self.backend.kind = kind;
        }

        if let Ok(path) = std::env::var("LLAMAKV_DATA_PATH") {
            self.backend.path = PathBuf::from(path);
        }

        if let Ok(cache) = std::env::var("LLAMAKV_CACHE")
            && let Some(kind) = CacheKind::parse(&cache)
        {
            self.cache.kind = kind;
        }

        self
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.cache.capacity == 0 {
            return Err(KvError::Config("cache.capacity must be at least 1".to_string()));
        }
        if self.distributed.max_queue_size == 0 {
            return Err(KvError::Config(
                "distributed.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.distributed.retry_attempts == 0 {
            return Err(KvError::Config(
                "distributed.retry_attempts must be at least 1".to_string(),
            ));
        }
        if !self.server.api_prefix.is_empty() && !self.server.api_prefix.starts_with('/') {
            return Err(KvError::Config(format!(
                "server.api_prefix must start with '/': {}",
                self.server.api_prefix
            )));
        }
        Ok(())
    }
}

fn parse_peers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.trim_end_matches('/').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.server.api_prefix, "/api/v1");
        assert_eq!(config.cache.kind, CacheKind::Lru);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.distributed.retry_attempts, 3);
        assert!(config.distributed.async_updates);
        assert!(!config.distributed.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            node_id = "a"

            [cache]
            kind = "ttl"
            capacity = 2
            max_size_bytes = 4096

            [backend]
            kind = "rocksdb"
            path = "/tmp/kv"

            [backend.rocksdb]
            block_cache_size = 1024

            [distributed]
            peers = ["http://b:8080"]
            retry_attempts = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.server.resolved_node_id(), "a");
        assert_eq!(config.cache.kind, CacheKind::Ttl);
        assert_eq!(config.cache.max_size_bytes, Some(4096));
        assert_eq!(config.backend.kind, BackendKind::RocksDb);
        assert_eq!(config.backend.rocksdb.block_cache_size, 1024);
        assert!(config.backend.rocksdb.enable_ttl_compaction);
        assert_eq!(config.distributed.peers.len(), 1);
        assert_eq!(config.distributed.retry_attempts, 1);
        // untouched sections keep defaults
        assert_eq!(config.store.purge_interval_secs, 60);
    }

    #[test]
    fn test_invalid_rejected() {
        assert!(matches!(
            Config::from_toml("[cache]\ncapacity = 0"),
            Err(KvError::Config(_))
        ));
        assert!(Config::from_toml("[distributed]\nmax_queue_size = 0").is_err());
        assert!(Config::from_toml("[distributed]\nretry_attempts = 0").is_err());
        assert!(Config::from_toml("[server]\napi_prefix = \"api\"").is_err());
        assert!(Config::from_toml("[cache]\nkind = \"fifo\"").is_err());
        assert!(Config::from_file("/nonexistent/llamakv.toml").is_err());
    }

    #[test]
    fn test_generated_node_id() {
        let server = ServerConfig::default();
        let id = server.resolved_node_id();
        assert!(id.starts_with(&format!("node-{}-", std::process::id())));

        let blank = ServerConfig {
            node_id: Some(String::new()),
            ..ServerConfig::default()
        };
        assert!(blank.resolved_node_id().starts_with("node-"));
    }

    #[test]
    fn test_parse_peers() {
        assert_eq!(
            parse_peers(" http://a:1/api/v1/ , ,http://b:2"),
            vec!["http://a:1/api/v1".to_string(), "http://b:2".to_string()]
        );
        assert!(parse_peers("").is_empty());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(BackendKind::parse("ROCKS"), Some(BackendKind::RocksDb));
        assert_eq!(BackendKind::parse("file"), Some(BackendKind::File));
        assert_eq!(BackendKind::parse("sql"), None);
        assert_eq!(CacheKind::parse("TTL"), Some(CacheKind::Ttl));
    }
}
