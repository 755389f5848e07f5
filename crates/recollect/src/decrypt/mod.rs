//! Session-pooled decryption with integrity verification
//!
//! `MemoryDecryptionPipeline` checks access on the ledger, decrypts through
//! the key-server router under a pooled session key, verifies the plaintext
//! against its declared hash and caches what it verified.

mod router;
mod session;
mod types;

pub use router::KeyServerRouter;
pub use session::SessionKeyPool;
pub use types::{
    BatchDecryptionResult, BatchDecryptionStats, DecryptionRequest, DecryptionResult,
    DecryptionStats, FailedDecryption, KeyServerStats,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{BoundedCache, CacheConfig};
use crate::collab::{BlobStore, KeyServer, MemoryLedger, SessionKey, SessionKeyIssuer, content_hash};
use crate::config::DecryptionConfig;
use crate::error::{RecollectError, Result};
use crate::retrieval::UnifiedMemoryResult;
use crate::retry::RetryPolicy;

/// Collaborators the decryption pipeline talks to
#[derive(Clone)]
pub struct DecryptionDeps {
    pub issuer: Arc<dyn SessionKeyIssuer>,
    pub key_servers: Vec<Arc<dyn KeyServer>>,
    pub ledger: Arc<dyn MemoryLedger>,
    pub blobs: Arc<dyn BlobStore>,
}

#[derive(Default)]
struct Counters {
    decryptions: AtomicU64,
    cache_hits: AtomicU64,
    integrity_failures: AtomicU64,
    access_denied: AtomicU64,
}

pub struct MemoryDecryptionPipeline {
    config: DecryptionConfig,
    sessions: SessionKeyPool,
    router: Arc<KeyServerRouter>,
    ledger: Arc<dyn MemoryLedger>,
    blobs: Arc<dyn BlobStore>,
    // Keyed by requester and content hash
    content_cache: BoundedCache<String, Bytes>,
    retry: RetryPolicy,
    counters: Counters,
}

impl MemoryDecryptionPipeline {
    pub fn new(config: DecryptionConfig, deps: DecryptionDeps) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let retry = RetryPolicy {
            max_retries: config.max_retry_attempts,
            initial_delay_ms: config.retry_base_delay_ms,
            ..RetryPolicy::default()
        };
        Self {
            sessions: SessionKeyPool::new(
                deps.issuer,
                config.max_session_keys,
                Duration::from_secs(config.session_key_ttl_secs),
            ),
            router: Arc::new(
                KeyServerRouter::new(deps.key_servers, config.failover_threshold, timeout)
                    .with_cooldown(Duration::from_secs(config.health_cooldown_secs)),
            ),
            ledger: deps.ledger,
            blobs: deps.blobs,
            content_cache: BoundedCache::new(CacheConfig::new(
                config.content_cache_size,
                Duration::from_secs(config.content_cache_ttl_secs),
            )),
            retry,
            counters: Counters::default(),
            config,
        }
    }

    /// At least one key server is configured and healthy or due a retry
    pub fn is_ready(&self) -> bool {
        !self.router.is_empty() && self.router.any_available()
    }

    /// Probe every key server, returning `(name, available)` pairs
    pub async fn probe(&self) -> Vec<(String, bool)> {
        self.router.probe().await
    }

    pub async fn get_or_create_session_key(&self, user_id: &str) -> Result<SessionKey> {
        self.sessions.get_or_create(user_id).await
    }

    fn cache_key(user_id: &str, content_hash: &str) -> String {
        format!("{user_id}:{content_hash}")
    }

    pub async fn decrypt_memory(&self, request: DecryptionRequest) -> Result<DecryptionResult> {
        let started = Instant::now();
        if request.memory_id.is_empty() || request.user_id.is_empty() {
            return Err(RecollectError::Validation(
                "decryption requires memory_id and user_id".into(),
            ));
        }
        if request.ciphertext.is_empty() || request.content_hash.is_empty() {
            return Err(RecollectError::Validation(format!(
                "decryption of {} requires ciphertext and content_hash",
                request.memory_id
            )));
        }

        let cache_key = Self::cache_key(&request.user_id, &request.content_hash);
        if let Some(plaintext) = self.content_cache.get(&cache_key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(memory_id = %request.memory_id, "Decrypted content cache hit");
            return Ok(DecryptionResult {
                memory_id: request.memory_id,
                plaintext,
                content_hash: request.content_hash,
                is_verified: true,
                key_server: None,
                from_cache: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        if !self.ledger.can_access(&request.user_id, &request.memory_id).await? {
            self.counters.access_denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                memory_id = %request.memory_id,
                user_id = %request.user_id,
                "Decryption denied"
            );
            return Err(RecollectError::AccessDenied(format!(
                "{} may not decrypt {}",
                request.user_id, request.memory_id
            )));
        }

        let key = match request.session_key {
            Some(key) => key,
            None => self.sessions.get_or_create(&request.user_id).await?,
        };
        let (plaintext, server) = self
            .router
            .decrypt(&request.ciphertext, &key, &request.user_id)
            .await?;

        let actual = content_hash(&plaintext);
        if actual != request.content_hash {
            self.counters.integrity_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                memory_id = %request.memory_id,
                key_server = %server,
                "Decrypted content does not match its hash"
            );
            return Err(RecollectError::Integrity {
                memory_id: request.memory_id,
                expected: request.content_hash,
                actual,
            });
        }

        self.counters.decryptions.fetch_add(1, Ordering::Relaxed);
        self.content_cache
            .set_with_size(cache_key, plaintext.clone(), plaintext.len());
        Ok(DecryptionResult {
            memory_id: request.memory_id,
            plaintext,
            content_hash: request.content_hash,
            is_verified: true,
            key_server: Some(server),
            from_cache: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run one pass over `pending` in chunks of `max_concurrent_decryptions`
    async fn decrypt_pass(
        &self,
        pending: Vec<(usize, DecryptionRequest)>,
    ) -> Vec<(usize, DecryptionRequest, Result<DecryptionResult>)> {
        let chunk_size = self.config.max_concurrent_decryptions.max(1);
        let mut outcomes = Vec::with_capacity(pending.len());
        for chunk in pending.chunks(chunk_size) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|(_, request)| self.decrypt_memory(request.clone())),
            )
            .await;
            outcomes.extend(
                chunk
                    .iter()
                    .cloned()
                    .zip(results)
                    .map(|((index, request), result)| (index, request, result)),
            );
        }
        outcomes
    }

    /// Decrypt many requests, isolating failures per item
    ///
    /// Items that fail with a retryable error are retried with backoff up to
    /// `max_retry_attempts` more times. Only a pipeline with no key servers
    /// fails the call as a whole.
    pub async fn decrypt_memory_batch(
        &self,
        requests: Vec<DecryptionRequest>,
    ) -> Result<BatchDecryptionResult> {
        if self.router.is_empty() {
            return Err(RecollectError::Config("no key servers configured".into()));
        }

        let started = Instant::now();
        let total = requests.len();
        let mut successful: Vec<(usize, DecryptionResult)> = Vec::with_capacity(total);
        let mut failed: Vec<(usize, FailedDecryption)> = Vec::new();
        let mut pending: Vec<(usize, DecryptionRequest)> = requests.into_iter().enumerate().collect();
        let mut attempts = 0u32;
        let mut retry_rounds = 0u32;

        loop {
            attempts += 1;
            let mut retry = Vec::new();
            for (index, request, result) in self.decrypt_pass(pending).await {
                match result {
                    Ok(result) => successful.push((index, result)),
                    Err(e) if e.is_retryable() && retry_rounds < self.retry.max_retries => {
                        debug!(memory_id = %request.memory_id, attempts, error = %e, "Decryption will be retried");
                        retry.push((index, request, e));
                    }
                    Err(e) => {
                        warn!(memory_id = %request.memory_id, attempts, error = %e, "Decryption failed");
                        failed.push((
                            index,
                            FailedDecryption {
                                memory_id: request.memory_id,
                                error: e,
                                attempts,
                            },
                        ));
                    }
                }
            }
            if retry.is_empty() {
                break;
            }

            let delay = self.retry.delay_for(retry_rounds);
            retry_rounds += 1;
            info!(
                count = retry.len(),
                round = retry_rounds,
                delay_ms = delay.as_millis() as u64,
                "Retrying failed decryptions"
            );
            tokio::time::sleep(delay).await;
            pending = retry.into_iter().map(|(index, request, _)| (index, request)).collect();
        }

        successful.sort_by_key(|(index, _)| *index);
        failed.sort_by_key(|(index, _)| *index);
        let stats = BatchDecryptionStats {
            total,
            successful: successful.len(),
            failed: failed.len(),
            retry_rounds,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            total,
            successful = stats.successful,
            failed = stats.failed,
            "Decryption batch finished"
        );
        Ok(BatchDecryptionResult {
            successful: successful.into_iter().map(|(_, r)| r).collect(),
            failed: failed.into_iter().map(|(_, f)| f).collect(),
            stats,
        })
    }

    /// Decrypt every encrypted result in place
    ///
    /// Ciphertext is fetched from the blob store (the blob id comes from the
    /// result, or from the ledger when the index entry predates storage).
    /// Results that cannot be fetched or decrypted stay encrypted and are
    /// reported in `failed`; order and scores are untouched.
    pub async fn decrypt_memory_results(
        &self,
        results: &mut [UnifiedMemoryResult],
        user_id: &str,
    ) -> Result<BatchDecryptionResult> {
        let targets: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.encrypted && r.content.is_none())
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return Ok(BatchDecryptionResult::default());
        }

        let fetches = targets.iter().map(|&i| {
            let result = &results[i];
            async move {
                let failure = |error: RecollectError| FailedDecryption {
                    memory_id: result.id.clone(),
                    error,
                    attempts: 1,
                };
                let blob_id = match &result.blob_id {
                    Some(id) => Some(id.clone()),
                    None => self
                        .ledger
                        .get_memory(&result.id)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|record| record.blob_id),
                };
                let Some(blob_id) = blob_id else {
                    debug!(memory_id = %result.id, "No stored blob for encrypted result");
                    return Err(failure(RecollectError::NotFound(format!(
                        "no stored ciphertext for {}",
                        result.id
                    ))));
                };
                match self.blobs.retrieve(&blob_id).await {
                    Ok(ciphertext) => Ok(DecryptionRequest::new(
                        result.id.clone(),
                        user_id,
                        ciphertext,
                        result.content_hash.clone(),
                    )),
                    Err(e) => {
                        warn!(memory_id = %result.id, error = %e, "Could not fetch ciphertext");
                        Err(failure(e))
                    }
                }
            }
        });
        let (requests, unfetched): (Vec<_>, Vec<_>) =
            join_all(fetches).await.into_iter().partition(|r| r.is_ok());
        let requests: Vec<DecryptionRequest> = requests.into_iter().filter_map(|r| r.ok()).collect();

        let mut batch = self.decrypt_memory_batch(requests).await?;
        batch.stats.total += unfetched.len();
        batch
            .failed
            .extend(unfetched.into_iter().filter_map(|r| r.err()));
        batch.stats.failed = batch.failed.len();
        for decrypted in &batch.successful {
            if let Some(result) = results.iter_mut().find(|r| r.id == decrypted.memory_id) {
                result.content = Some(decrypted.text());
                result.decrypted = true;
            }
        }
        Ok(batch)
    }

    pub fn key_server_stats(&self) -> Vec<KeyServerStats> {
        self.router.stats()
    }

    pub fn session_key_count(&self) -> usize {
        self.sessions.len()
    }

    /// Background sweeps of expired session keys and decrypted content,
    /// plus periodic key-server health checks
    pub fn spawn_session_sweeper(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.sessions
                .spawn_sweeper(Duration::from_secs(self.config.sweep_interval_secs)),
            self.content_cache.spawn_sweeper(),
        ];
        if self.config.health_check_interval_secs > 0 && !self.router.is_empty() {
            handles.push(
                self.router
                    .spawn_health_checks(Duration::from_secs(self.config.health_check_interval_secs)),
            );
        }
        handles
    }

    pub fn stats(&self) -> DecryptionStats {
        DecryptionStats {
            session_keys: self.sessions.len(),
            decryptions: self.counters.decryptions.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
            access_denied: self.counters.access_denied.load(Ordering::Relaxed),
            content_cache: self.content_cache.stats(),
            key_servers: self.router.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryLedger, MemoryRecord};
    use crate::retrieval::{RelevanceBreakdown, SearchType};
    use crate::testing::{MemoryBlobStore, MockKeyServer, MockSessionIssuer, seal_for_tests};
    use chrono::Utc;

    struct Fixture {
        pipeline: MemoryDecryptionPipeline,
        ledger: Arc<InMemoryLedger>,
        server: Arc<MockKeyServer>,
        issuer: Arc<MockSessionIssuer>,
        blobs: Arc<MemoryBlobStore>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let server = Arc::new(MockKeyServer::new("ks1"));
        let issuer = Arc::new(MockSessionIssuer::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let config = DecryptionConfig {
            retry_base_delay_ms: 10,
            ..DecryptionConfig::default()
        };
        let pipeline = MemoryDecryptionPipeline::new(
            config,
            DecryptionDeps {
                issuer: issuer.clone(),
                key_servers: vec![server.clone() as Arc<dyn KeyServer>],
                ledger: ledger.clone(),
                blobs: blobs.clone(),
            },
        );
        Fixture {
            pipeline,
            ledger,
            server,
            issuer,
            blobs,
        }
    }

    fn record(id: &str, owner: &str, hash: &str, blob_id: Option<String>) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            owner: owner.into(),
            category: "general".into(),
            importance: 5.0,
            tags: vec![],
            content_type: "text/plain".into(),
            created_at: Utc::now(),
            blob_id,
            content_hash: hash.into(),
            encrypted: true,
            content: None,
        }
    }

    async fn own(ledger: &InMemoryLedger, id: &str, owner: &str, hash: &str) {
        ledger.record_memory(&record(id, owner, hash, None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_decrypt_verifies_and_caches() {
        let f = fixture();
        let (ciphertext, hash) = seal_for_tests("remember the milk");
        own(&f.ledger, "m1", "u1", &hash).await;

        let request = DecryptionRequest::new("m1", "u1", ciphertext, hash);
        let first = f.pipeline.decrypt_memory(request.clone()).await.unwrap();
        assert!(first.is_verified);
        assert_eq!(first.text(), "remember the milk");
        assert_eq!(first.key_server.as_deref(), Some("ks1"));

        let second = f.pipeline.decrypt_memory(request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(f.server.call_count(), 1);
        assert_eq!(f.issuer.issued(), 1);
    }

    #[tokio::test]
    async fn test_non_owner_is_denied() {
        let f = fixture();
        let (ciphertext, hash) = seal_for_tests("private");
        own(&f.ledger, "m1", "u1", &hash).await;

        let err = f
            .pipeline
            .decrypt_memory(DecryptionRequest::new("m1", "u2", ciphertext.clone(), hash.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RecollectError::AccessDenied(_)));
        assert_eq!(f.server.call_count(), 0);

        f.ledger.grant_access("u1", "m1", "u2").await.unwrap();
        let ok = f
            .pipeline
            .decrypt_memory(DecryptionRequest::new("m1", "u2", ciphertext, hash))
            .await
            .unwrap();
        assert_eq!(ok.text(), "private");
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_integrity_error() {
        let f = fixture();
        let (ciphertext, _) = seal_for_tests("tampered");
        own(&f.ledger, "m1", "u1", "deadbeef").await;

        let err = f
            .pipeline
            .decrypt_memory(DecryptionRequest::new("m1", "u1", ciphertext, "deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecollectError::Integrity { .. }));
        assert!(!err.is_retryable());
        assert_eq!(f.pipeline.stats().integrity_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retries_transient_failures() {
        let f = fixture();
        let mut requests = Vec::new();
        for i in 0..3 {
            let text = format!("note {i}");
            let (ciphertext, hash) = seal_for_tests(&text);
            own(&f.ledger, &format!("m{i}"), "u1", &hash).await;
            requests.push(DecryptionRequest::new(format!("m{i}"), "u1", ciphertext, hash));
        }
        f.server.fail_times(2);

        let batch = f.pipeline.decrypt_memory_batch(requests).await.unwrap();
        assert_eq!(batch.successful.len(), 3);
        assert!(batch.failed.is_empty());
        assert_eq!(batch.stats.retry_rounds, 1);
        let ids: Vec<&str> = batch.successful.iter().map(|r| r.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_unfetchable_ciphertext_counts_as_failed() {
        let f = fixture();
        let mut results = Vec::new();
        for (id, text) in [("m1", "stored note"), ("m2", "lost note")] {
            let (ciphertext, hash) = seal_for_tests(text);
            let blob_id = f.blobs.upload(ciphertext).await.unwrap();
            let blob_id = if id == "m1" { blob_id } else { "missing".to_string() };
            let memory = record(id, "u1", &hash, Some(blob_id));
            f.ledger.record_memory(&memory).await.unwrap();
            results.push(UnifiedMemoryResult::from_record(
                memory,
                SearchType::Vector,
                RelevanceBreakdown::default(),
            ));
        }

        let batch = f.pipeline.decrypt_memory_results(&mut results, "u1").await.unwrap();
        assert_eq!(batch.stats.total, 2);
        assert_eq!(batch.stats.successful, 1);
        assert_eq!(batch.stats.failed, 1);
        assert_eq!(batch.failed[0].memory_id, "m2");
        assert!(matches!(batch.failed[0].error, RecollectError::NotFound(_)));
        assert!(results[0].decrypted);
        assert!(results[1].content.is_none());

        f.blobs.set_unavailable(true);
        results[0].content = None;
        let batch = f.pipeline.decrypt_memory_results(&mut results, "u1").await.unwrap();
        assert_eq!(batch.stats.failed, 2);
        assert!(batch.successful.is_empty());
    }

    #[tokio::test]
    async fn test_batch_without_key_servers_is_an_error() {
        let pipeline = MemoryDecryptionPipeline::new(
            DecryptionConfig::default(),
            DecryptionDeps {
                issuer: Arc::new(MockSessionIssuer::new()),
                key_servers: vec![],
                ledger: Arc::new(InMemoryLedger::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
            },
        );
        assert!(!pipeline.is_ready());
        assert!(matches!(
            pipeline.decrypt_memory_batch(vec![]).await,
            Err(RecollectError::Config(_))
        ));
    }
}
