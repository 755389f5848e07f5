//! Deterministic collaborators for unit and integration tests
//!
//! None of these touch the network or load a model. Each one counts its calls
//! and can be told to fail so tests can assert on deduplication and error
//! paths.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;

use crate::collab::{BlobStore, Embedder, KeyServer, SessionKey, SessionKeyIssuer, content_hash};
use crate::error::{RecollectError, Result};

pub const MOCK_DIMENSION: usize = 384;

const XOR_KEY: u8 = 0x5A;

fn token_seed(token: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    hasher.finish()
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Bag-of-words hash embedder
///
/// Every lowercase token maps to a fixed pseudo-random direction and a text
/// embeds to the sum of its tokens, so identical texts have similarity 1.0
/// and texts sharing words land closer than unrelated ones.
#[derive(Debug)]
pub struct HashEmbedder {
    dimension: usize,
    batch_calls: AtomicUsize,
    text_calls: AtomicUsize,
    per_text: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(MOCK_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            batch_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            per_text: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make `text` come back empty from `embed_batch` and fail `embed_text`
    pub fn fail_on(&self, text: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(text.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.batch_calls() + self.text_calls()
    }

    /// How many times `text` was sent to the model, through either call
    pub fn calls_for(&self, text: &str) -> usize {
        self.per_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(text)
            .copied()
            .unwrap_or(0)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let seed = token_seed(&token.to_lowercase());
            for (i, slot) in vector.iter_mut().enumerate() {
                let bits = splitmix(seed ^ (i as u64).wrapping_mul(0x2545f4914f6cdd1d));
                *slot += (bits as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32;
            }
        }
        vector
    }

    fn record(&self, text: &str) {
        *self
            .per_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(text.to_string())
            .or_default() += 1;
    }

    fn is_failing(&self, text: &str) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(text)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecollectError::unavailable("embedding", "mock embedder offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.record(text);
        if self.is_failing(text) {
            return Err(RecollectError::Embedding(format!("cannot embed {text:?}")));
        }
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(texts
            .iter()
            .map(|text| {
                self.record(text);
                if self.is_failing(text) {
                    Vec::new()
                } else {
                    self.vector_for(text)
                }
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash-embedder"
    }
}

/// XOR "cipher" shared by `seal_for_tests` and `MockKeyServer`
pub fn xor_cipher(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ XOR_KEY).collect()
}

/// Ciphertext the mock key server decrypts back to `plaintext`, and the
/// plaintext's content hash
pub fn seal_for_tests(plaintext: &str) -> (Bytes, String) {
    (
        Bytes::from(xor_cipher(plaintext.as_bytes())),
        content_hash(plaintext.as_bytes()),
    )
}

/// Key server that decrypts `xor_cipher` output
#[derive(Debug)]
pub struct MockKeyServer {
    name: String,
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    down: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockKeyServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` decrypt calls with `Unavailable`
    pub fn fail_times(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// A down server fails every call and its health probe
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyServer for MockKeyServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decrypt(&self, ciphertext: &[u8], key: &SessionKey, user_id: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(RecollectError::unavailable(&self.name, "key server down"));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RecollectError::unavailable(&self.name, "injected failure"));
        }
        if key.user_id != user_id {
            return Err(RecollectError::AccessDenied(format!(
                "session key for {} used by {user_id}",
                key.user_id
            )));
        }
        Ok(Bytes::from(xor_cipher(ciphertext)))
    }

    async fn is_available(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

/// Issues `"<user>-<n>"` handles and counts how many it issued
#[derive(Debug, Default)]
pub struct MockSessionIssuer {
    issued: AtomicUsize,
    per_user: DashMap<String, usize>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockSessionIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn issued_for(&self, user_id: &str) -> usize {
        self.per_user.get(user_id).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl SessionKeyIssuer for MockSessionIssuer {
    async fn create_session_key(&self, user_id: &str) -> Result<SessionKey> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RecollectError::unavailable("session-issuer", "mock issuer offline"));
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        let n = {
            let mut count = self.per_user.entry(user_id.to_string()).or_default();
            *count += 1;
            *count
        };
        Ok(SessionKey {
            user_id: user_id.to_string(),
            handle: format!("{user_id}-{n}"),
            issued_at: Utc::now(),
        })
    }
}

/// Content-addressed blob store held in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
    uploads: AtomicUsize,
    retrievals: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecollectError::unavailable("blob-store", "mock store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, content: Bytes) -> Result<String> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let id = content_hash(&content);
        self.blobs.insert(id.clone(), content);
        Ok(id)
    }

    async fn retrieve(&self, blob_id: &str) -> Result<Bytes> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.blobs
            .get(blob_id)
            .map(|b| b.clone())
            .ok_or_else(|| RecollectError::NotFound(format!("blob {blob_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::cosine_similarity;

    #[test]
    fn test_hash_embedding_is_deterministic() {
        let embedder = HashEmbedder::new();
        assert_eq!(embedder.vector_for("hello world"), embedder.vector_for("hello world"));
        assert_eq!(embedder.vector_for("test").len(), MOCK_DIMENSION);
    }

    #[test]
    fn test_shared_words_are_closer() {
        let embedder = HashEmbedder::new();
        let base = embedder.vector_for("user likes dark roast coffee");
        let related = embedder.vector_for("coffee preferences dark roast");
        let unrelated = embedder.vector_for("quarterly tax filing deadline");
        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
        assert!((cosine_similarity(&base, &base) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_failing_text_comes_back_empty() {
        let embedder = HashEmbedder::new();
        embedder.fail_on("bad");
        let out = embedder
            .embed_batch(&["good".to_string(), "bad".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0].len(), MOCK_DIMENSION);
        assert!(out[1].is_empty());
        assert_eq!(embedder.batch_calls(), 1);
        assert_eq!(embedder.calls_for("bad"), 1);
    }

    #[tokio::test]
    async fn test_mock_key_server_round_trip() {
        let server = MockKeyServer::new("ks1");
        let issuer = MockSessionIssuer::new();
        let key = issuer.create_session_key("u1").await.unwrap();
        let (ciphertext, hash) = seal_for_tests("secret note");

        server.fail_times(1);
        assert!(server.decrypt(&ciphertext, &key, "u1").await.unwrap_err().is_retryable());

        let plain = server.decrypt(&ciphertext, &key, "u1").await.unwrap();
        assert_eq!(plain, Bytes::from_static(b"secret note"));
        assert_eq!(content_hash(&plain), hash);
        assert_eq!(server.call_count(), 2);
        assert_eq!(issuer.issued_for("u1"), 1);
    }

    #[tokio::test]
    async fn test_memory_blob_store() {
        let store = MemoryBlobStore::new();
        let id = store.upload(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.retrieve(&id).await.unwrap(), Bytes::from_static(b"abc"));
        assert!(matches!(
            store.retrieve("missing").await,
            Err(RecollectError::NotFound(_))
        ));
        store.set_unavailable(true);
        assert!(store.retrieve(&id).await.unwrap_err().is_retryable());
    }
}
