use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{RecollectError, Result};

/// Main configuration structure for Recollect
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Local data directories
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,
    /// Ingestion pipeline queues
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Shared cache defaults
    #[serde(default)]
    pub cache: CacheSettings,
    /// Search orchestration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Session keys and key servers
    #[serde(default)]
    pub decryption: DecryptionConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:7777")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Storage location configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Base directory for blobs, the vector table, the ledger and the graph
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.jsonl")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join("graph.jsonl")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".recollect"))
        .unwrap_or_else(|| PathBuf::from(".recollect"))
}

/// Embedding model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// "local" (fastembed), "remote" (OpenAI-compatible API) or "hash"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Model name or identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Base URL for the remote provider
    #[serde(default = "default_embedding_api_url")]
    pub api_url: String,
    /// Environment variable holding the remote API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Embedding dimension size
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Maximum texts per embedding call
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    /// Remote request timeout in seconds
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            api_url: default_embedding_api_url(),
            api_key_env: None,
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_embedding_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

/// Vector index configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// "memory" or "lance"
    #[serde(default = "default_index_backend")]
    pub backend: String,
    /// Candidate list size for approximate search
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Minimum similarity a vector hit must reach
    #[serde(default = "default_similarity_threshold")]
    pub default_threshold: f32,
    /// Buffered writes committed automatically past this count
    #[serde(default = "default_auto_flush_threshold")]
    pub auto_flush_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            ef_search: default_ef_search(),
            default_threshold: default_similarity_threshold(),
            auto_flush_threshold: default_auto_flush_threshold(),
        }
    }
}

fn default_index_backend() -> String {
    "lance".to_string()
}

fn default_ef_search() -> usize {
    100
}

fn default_similarity_threshold() -> f32 {
    0.3
}

fn default_auto_flush_threshold() -> usize {
    256
}

/// Size and delay thresholds for one batch queue
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue length that triggers an immediate flush
    pub max_batch_size: usize,
    /// Inactivity delay before a partial batch is flushed
    pub batch_delay_ms: u64,
}

impl QueueConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_embedding_queue")]
    pub embedding: QueueConfig,
    #[serde(default = "default_indexing_queue")]
    pub indexing: QueueConfig,
    #[serde(default = "default_storage_queue")]
    pub storage: QueueConfig,
    /// Concurrent chunk processors per queue
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Capacity of the memory-state cache used for deduplication
    #[serde(default = "default_memory_cache_size")]
    pub memory_cache_size: usize,
    /// Lifetime of memory-state entries in seconds
    #[serde(default = "default_memory_cache_ttl_secs")]
    pub memory_cache_ttl_secs: u64,
    /// Terminal jobs older than this are pruned
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embedding: default_embedding_queue(),
            indexing: default_indexing_queue(),
            storage: default_storage_queue(),
            max_concurrent: default_max_concurrent(),
            memory_cache_size: default_memory_cache_size(),
            memory_cache_ttl_secs: default_memory_cache_ttl_secs(),
            job_retention_secs: default_job_retention_secs(),
        }
    }
}

fn default_embedding_queue() -> QueueConfig {
    QueueConfig {
        max_batch_size: 20,
        batch_delay_ms: 2_000,
    }
}

fn default_indexing_queue() -> QueueConfig {
    QueueConfig {
        max_batch_size: 50,
        batch_delay_ms: 1_000,
    }
}

fn default_storage_queue() -> QueueConfig {
    QueueConfig {
        max_batch_size: 10,
        batch_delay_ms: 3_000,
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_memory_cache_size() -> usize {
    10_000
}

fn default_memory_cache_ttl_secs() -> u64 {
    3_600
}

fn default_job_retention_secs() -> u64 {
    3_600
}

/// Defaults applied to scheduler-owned caches
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between background sweeps of expired entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig::new(self.max_size, Duration::from_secs(self.ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_cache_max_size() -> usize {
    1_000
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// Search orchestration configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Result count when a query gives no `k`
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_query_cache_ttl_secs")]
    pub query_cache_ttl_secs: u64,
    #[serde(default = "default_content_cache_ttl_secs")]
    pub content_cache_ttl_secs: u64,
    #[serde(default = "default_analytics_cache_ttl_secs")]
    pub analytics_cache_ttl_secs: u64,
    /// Capacity of each retrieval cache
    #[serde(default = "default_retrieval_cache_size")]
    pub cache_size: usize,
    /// Capacity of the query-embedding LRU
    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: usize,
    /// Maximum entities consulted by the graph strategy
    #[serde(default = "default_graph_max_results")]
    pub graph_max_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            query_cache_ttl_secs: default_query_cache_ttl_secs(),
            content_cache_ttl_secs: default_content_cache_ttl_secs(),
            analytics_cache_ttl_secs: default_analytics_cache_ttl_secs(),
            cache_size: default_retrieval_cache_size(),
            embedding_cache_size: default_embedding_cache_size(),
            graph_max_results: default_graph_max_results(),
        }
    }
}

fn default_k() -> usize {
    50
}

fn default_query_cache_ttl_secs() -> u64 {
    5 * 60
}

fn default_content_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_analytics_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_retrieval_cache_size() -> usize {
    500
}

fn default_embedding_cache_size() -> usize {
    256
}

fn default_graph_max_results() -> usize {
    10
}

/// One configured key-server endpoint
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyServerEndpoint {
    pub name: String,
    pub url: String,
}

/// Decryption pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecryptionConfig {
    #[serde(default = "default_max_session_keys")]
    pub max_session_keys: usize,
    #[serde(default = "default_session_key_ttl_secs")]
    pub session_key_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Decrypt calls in flight per chunk
    #[serde(default = "default_max_concurrent_decryptions")]
    pub max_concurrent_decryptions: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Per-decrypt timeout in milliseconds
    #[serde(default = "default_decrypt_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_content_cache_size")]
    pub content_cache_size: usize,
    #[serde(default = "default_content_cache_ttl_secs")]
    pub content_cache_ttl_secs: u64,
    /// Consecutive failures after which a key server is skipped
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    /// Seconds before an unhealthy key server is tried again
    #[serde(default = "default_health_cooldown_secs")]
    pub health_cooldown_secs: u64,
    /// Seconds between key-server health checks; 0 disables them
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub key_servers: Vec<KeyServerEndpoint>,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            max_session_keys: default_max_session_keys(),
            session_key_ttl_secs: default_session_key_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_concurrent_decryptions: default_max_concurrent_decryptions(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            timeout_ms: default_decrypt_timeout_ms(),
            content_cache_size: default_content_cache_size(),
            content_cache_ttl_secs: default_content_cache_ttl_secs(),
            failover_threshold: default_failover_threshold(),
            health_cooldown_secs: default_health_cooldown_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            key_servers: Vec::new(),
        }
    }
}

fn default_max_session_keys() -> usize {
    100
}

fn default_session_key_ttl_secs() -> u64 {
    3_600
}

fn default_max_concurrent_decryptions() -> usize {
    5
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_decrypt_timeout_ms() -> u64 {
    10_000
}

fn default_content_cache_size() -> usize {
    1_000
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_health_cooldown_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    60
}

const EMBEDDING_PROVIDERS: &[&str] = &["local", "remote", "hash"];
const INDEX_BACKENDS: &[&str] = &["memory", "lance"];

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, falling back to built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        for candidate in Self::default_paths() {
            if candidate.exists() {
                tracing::info!("Loading config from: {}", candidate.display());
                return Self::from_file(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Search order used when no explicit path is given
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".recollect").join("config.toml")),
            dirs::config_dir().map(|c| c.join("recollect").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecollectError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RecollectError::Config(format!("Failed to parse config: {e}")))
    }

    /// Reject configurations the daemon could not run with
    pub fn validate(&self) -> Result<()> {
        if !EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            return Err(RecollectError::Config(format!(
                "Unknown embedding provider '{}' (expected one of {})",
                self.embedding.provider,
                EMBEDDING_PROVIDERS.join(", ")
            )));
        }
        if !INDEX_BACKENDS.contains(&self.index.backend.as_str()) {
            return Err(RecollectError::Config(format!(
                "Unknown index backend '{}' (expected one of {})",
                self.index.backend,
                INDEX_BACKENDS.join(", ")
            )));
        }
        if self.embedding.dimension == 0 || self.embedding.batch_size == 0 {
            return Err(RecollectError::Config(
                "embedding.dimension and embedding.batch_size must be positive".to_string(),
            ));
        }

        for (name, queue) in [
            ("embedding", &self.pipeline.embedding),
            ("indexing", &self.pipeline.indexing),
            ("storage", &self.pipeline.storage),
        ] {
            if queue.max_batch_size == 0 {
                return Err(RecollectError::Config(format!(
                    "pipeline.{name}.max_batch_size must be positive"
                )));
            }
        }
        if self.pipeline.max_concurrent == 0 {
            return Err(RecollectError::Config(
                "pipeline.max_concurrent must be positive".to_string(),
            ));
        }

        for (name, size) in [
            ("pipeline.memory_cache_size", self.pipeline.memory_cache_size),
            ("cache.max_size", self.cache.max_size),
            ("retrieval.cache_size", self.retrieval.cache_size),
            ("retrieval.embedding_cache_size", self.retrieval.embedding_cache_size),
            ("decryption.content_cache_size", self.decryption.content_cache_size),
            ("decryption.max_session_keys", self.decryption.max_session_keys),
        ] {
            if size == 0 {
                return Err(RecollectError::Config(format!("{name} must be positive")));
            }
        }

        if self.decryption.max_concurrent_decryptions == 0 {
            return Err(RecollectError::Config(
                "decryption.max_concurrent_decryptions must be positive".to_string(),
            ));
        }

        for endpoint in &self.decryption.key_servers {
            let parsed = url::Url::parse(&endpoint.url).map_err(|e| {
                RecollectError::Config(format!(
                    "Invalid URL for key server '{}': {e}",
                    endpoint.name
                ))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(RecollectError::Config(format!(
                    "Key server '{}' must use http or https",
                    endpoint.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7777");
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.index.backend, "lance");
        assert_eq!(config.pipeline.embedding.max_batch_size, 20);
        assert_eq!(config.retrieval.default_k, 50);
        assert_eq!(config.retrieval.query_cache_ttl_secs, 300);
        assert_eq!(config.retrieval.content_cache_ttl_secs, 1_800);
        assert_eq!(config.retrieval.analytics_cache_ttl_secs, 3_600);
        assert_eq!(config.decryption.max_session_keys, 100);
        assert_eq!(config.decryption.max_concurrent_decryptions, 5);
        assert!(config.decryption.key_servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0:8000"

            [pipeline.embedding]
            max_batch_size = 5
            batch_delay_ms = 250

            [[decryption.key_servers]]
            name = "ks-a"
            url = "https://ks-a.example.com"

            [[decryption.key_servers]]
            name = "ks-b"
            url = "http://10.0.0.2:9000"
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.pipeline.embedding.max_batch_size, 5);
        assert_eq!(
            config.pipeline.embedding.batch_delay(),
            Duration::from_millis(250)
        );
        // Untouched sections keep their defaults
        assert_eq!(config.pipeline.indexing.max_batch_size, 50);
        assert_eq!(config.decryption.key_servers.len(), 2);
        assert_eq!(config.decryption.key_servers[1].name, "ks-b");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.storage.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index.backend = "faiss".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retrieval.cache_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.decryption.key_servers.push(KeyServerEndpoint {
            name: "broken".to_string(),
            url: "not a url".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = Config::from_toml("[server\nlisten_addr = 1").unwrap_err();
        assert!(matches!(err, RecollectError::Config(_)));
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[embedding]\nprovider = \"hash\"\ndimension = 64\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dimension, 64);

        let missing = dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_cache_settings_conversion() {
        let settings = CacheSettings {
            max_size: 10,
            ttl_secs: 60,
            sweep_interval_secs: 5,
        };
        let config = settings.to_cache_config();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }
}
