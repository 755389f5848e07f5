//! Collaborator contracts consumed by the core
//!
//! The pipeline, retrieval and decryption components only ever talk to the
//! outside world through these traits. Reference implementations live in the
//! submodules; deterministic mocks live in [`crate::testing`].

pub mod blob;
pub mod embedding;
pub mod graph;
pub mod index;
pub mod journal;
pub mod keyserver;
pub mod lance;
pub mod ledger;

pub use blob::FsBlobStore;
pub use embedding::{LocalEmbedder, RemoteEmbedder};
pub use graph::InMemoryKnowledgeGraph;
pub use index::InMemoryVectorIndex;
pub use journal::{FsKnowledgeGraph, FsLedger};
pub use keyserver::HttpKeyServer;
pub use lance::LanceVectorIndex;
pub use ledger::InMemoryLedger;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Descriptor of one stored memory, shared by the index, the ledger and the
/// retrieval results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub owner: String,
    pub category: String,
    /// 0-10
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub blob_id: Option<String>,
    /// SHA-256 of the plaintext, hex encoded
    pub content_hash: String,
    pub encrypted: bool,
    /// Inline plaintext, present for unencrypted memories only
    #[serde(default)]
    pub content: Option<String>,
}

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    /// Cosine distance, 0.0 for identical direction
    pub distance: f32,
    pub record: MemoryRecord,
}

/// Parameters for a similarity search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub k: usize,
    pub ef_search: usize,
    /// Minimum similarity (1 - distance) a hit must reach
    pub threshold: Option<f32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: 50,
            ef_search: 100,
            threshold: None,
        }
    }
}

/// An entity found in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub label: String,
    /// How well the entity matched the search text (0.0-1.0)
    pub score: f32,
}

/// A per-user decryption capability issued by a key server
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub user_id: String,
    pub handle: String,
    pub issued_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("user_id", &self.user_id)
            .field("handle", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Text embedding model
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts in one call. The output is 1:1 with the input; an
    /// entry that could not be embedded comes back empty.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Approximate nearest-neighbour index over memory embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<VectorHit>>;

    /// Buffer a vector for insertion; it becomes searchable after a flush
    async fn add_vector_batched(
        &self,
        user_id: &str,
        id: &str,
        vector: Vec<f32>,
        record: MemoryRecord,
    ) -> Result<()>;

    /// Commit buffered writes, returning how many were flushed
    async fn force_flush(&self, reason: &str) -> Result<usize>;

    async fn get(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>>;
}

/// Entity graph linking labels to the memories that mention them
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn search_graph(&self, text: &str, max_results: usize) -> Result<Vec<GraphEntity>>;

    async fn find_memories_related_to_entity(&self, label: &str, user_id: &str)
    -> Result<Vec<String>>;

    async fn link_entities(&self, user_id: &str, memory_id: &str, entities: &[String])
    -> Result<()>;

    async fn entities_for_memory(&self, user_id: &str, memory_id: &str) -> Result<Vec<String>>;
}

/// Durable content-addressed blob storage
///
/// Implementations must return `NotFound` for a missing blob and
/// `Unavailable` when the store itself cannot be reached.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, content: Bytes) -> Result<String>;

    async fn retrieve(&self, blob_id: &str) -> Result<Bytes>;
}

/// Ownership and access-control ledger
#[async_trait]
pub trait MemoryLedger: Send + Sync {
    /// Record a stored memory, returning a transaction digest
    async fn record_memory(&self, record: &MemoryRecord) -> Result<String>;

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>>;

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>>;

    /// True when `user_id` owns the memory or was granted access to it
    async fn can_access(&self, user_id: &str, memory_id: &str) -> Result<bool>;

    async fn grant_access(&self, owner: &str, memory_id: &str, grantee: &str) -> Result<()>;
}

/// Issues per-user session keys
#[async_trait]
pub trait SessionKeyIssuer: Send + Sync {
    async fn create_session_key(&self, user_id: &str) -> Result<SessionKey>;
}

/// One key-server endpoint able to decrypt under a session key
#[async_trait]
pub trait KeyServer: Send + Sync {
    fn name(&self) -> &str;

    async fn decrypt(&self, ciphertext: &[u8], key: &SessionKey, user_id: &str) -> Result<Bytes>;

    async fn is_available(&self) -> bool;
}

/// Hex-encoded SHA-256 of `data`
pub fn content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

/// Cosine similarity of two vectors, 0.0 when either is zero or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
