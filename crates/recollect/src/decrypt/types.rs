use bytes::Bytes;
use serde::Serialize;

use crate::cache::CacheStats;
use crate::collab::SessionKey;
use crate::error::RecollectError;

/// One unit of decryption work
#[derive(Debug, Clone)]
pub struct DecryptionRequest {
    pub memory_id: String,
    /// Requesting address; must own or have been granted the memory
    pub user_id: String,
    pub ciphertext: Bytes,
    /// Declared SHA-256 of the plaintext, hex encoded
    pub content_hash: String,
    /// Skip the pool and decrypt under this key
    pub session_key: Option<SessionKey>,
}

impl DecryptionRequest {
    pub fn new(
        memory_id: impl Into<String>,
        user_id: impl Into<String>,
        ciphertext: Bytes,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            memory_id: memory_id.into(),
            user_id: user_id.into(),
            ciphertext,
            content_hash: content_hash.into(),
            session_key: None,
        }
    }

    pub fn with_session_key(mut self, key: SessionKey) -> Self {
        self.session_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecryptionResult {
    pub memory_id: String,
    #[serde(skip)]
    pub plaintext: Bytes,
    pub content_hash: String,
    /// Plaintext hash matched the declared hash
    pub is_verified: bool,
    /// Key server that served the request, `None` for a cache hit
    pub key_server: Option<String>,
    pub from_cache: bool,
    pub elapsed_ms: u64,
}

impl DecryptionResult {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.plaintext).into_owned()
    }
}

/// A request that was given up on
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDecryption {
    pub memory_id: String,
    pub error: RecollectError,
    /// Attempts made, including the first pass
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchDecryptionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Retry passes that ran after the first pass
    pub retry_rounds: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchDecryptionResult {
    /// In request order
    pub successful: Vec<DecryptionResult>,
    pub failed: Vec<FailedDecryption>,
    pub stats: BatchDecryptionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyServerStats {
    pub name: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub average_latency_ms: f64,
    /// 1.0 before the first request
    pub success_rate: f64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecryptionStats {
    pub session_keys: usize,
    pub decryptions: u64,
    pub cache_hits: u64,
    pub integrity_failures: u64,
    pub access_denied: u64,
    pub content_cache: CacheStats,
    pub key_servers: Vec<KeyServerStats>,
}
