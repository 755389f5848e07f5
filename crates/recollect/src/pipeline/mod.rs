//! Ingestion pipeline: embedding → indexing → storage
//!
//! `BatchManager` owns one `BatchingService` per stage and moves every
//! submitted memory through them, tracking each submission as a job.

mod job;
mod processors;

pub use job::{JobCounts, JobEvent, JobEventKind, JobStage, JobState, JobStatus, JobTracker};

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::batch::{BatchItem, BatchOptions, BatchingService, Priority, SchedulerConfig, SchedulerStats};
use crate::cache::{BoundedCache, CacheConfig, CacheStats};
use crate::collab::{
    BlobStore, Embedder, KnowledgeGraph, MemoryLedger, MemoryRecord, VectorIndex, content_hash,
};
use crate::config::PipelineConfig;
use crate::error::{RecollectError, Result};
use crate::retry::RetryPolicy;

pub const EMBEDDING_QUEUE: &str = "embedding";
pub const INDEXING_QUEUE: &str = "indexing";
pub const STORAGE_QUEUE: &str = "storage";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ciphertext submitted alongside the plaintext used for embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedContent {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Bytes,
    /// SHA-256 of the plaintext, hex encoded
    pub content_hash: String,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A memory submitted for ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInput {
    #[serde(default = "new_memory_id")]
    pub id: String,
    pub user_id: String,
    /// Plaintext; embedded, and stored inline unless `sealed` is present
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Entity labels linked into the knowledge graph at indexing time
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub sealed: Option<SealedContent>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Random id for a memory submitted without one
pub fn new_memory_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_category() -> String {
    "general".to_string()
}

fn default_importance() -> f32 {
    5.0
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

impl MemoryInput {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            content: content.into(),
            category: default_category(),
            importance: default_importance(),
            tags: Vec::new(),
            entities: Vec::new(),
            content_type: default_content_type(),
            sealed: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_entities(mut self, entities: &[&str]) -> Self {
        self.entities = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Store `ciphertext` instead of the plaintext
    pub fn sealed(mut self, ciphertext: Bytes, content_hash: impl Into<String>) -> Self {
        self.sealed = Some(SealedContent {
            ciphertext,
            content_hash: content_hash.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RecollectError::Validation("memory id is required".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(RecollectError::Validation("user_id is required".into()));
        }
        if self.content.trim().is_empty() {
            return Err(RecollectError::Validation("content must not be empty".into()));
        }
        if !(0.0..=10.0).contains(&self.importance) {
            return Err(RecollectError::Validation(format!(
                "importance must be within 0-10, got {}",
                self.importance
            )));
        }
        if let Some(sealed) = &self.sealed {
            if sealed.ciphertext.is_empty() {
                return Err(RecollectError::Validation("sealed ciphertext is empty".into()));
            }
            if sealed.content_hash.trim().is_empty() {
                return Err(RecollectError::Validation(
                    "sealed content requires a content_hash".into(),
                ));
            }
        }
        Ok(())
    }

    /// Descriptor stored in the index and the ledger
    pub fn to_record(&self) -> MemoryRecord {
        let (content_hash, content) = match &self.sealed {
            Some(sealed) => (sealed.content_hash.clone(), None),
            None => (content_hash(self.content.as_bytes()), Some(self.content.clone())),
        };
        MemoryRecord {
            id: self.id.clone(),
            owner: self.user_id.clone(),
            category: self.category.clone(),
            importance: self.importance,
            tags: self.tags.clone(),
            content_type: self.content_type.clone(),
            created_at: self.created_at,
            blob_id: None,
            content_hash,
            encrypted: self.sealed.is_some(),
            content,
        }
    }

    /// Bytes written to the blob store
    fn blob_body(&self) -> Bytes {
        match &self.sealed {
            Some(sealed) => sealed.ciphertext.clone(),
            None => Bytes::from(self.content.clone()),
        }
    }
}

/// Scheduling hints for a submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Flush the embedding queue on the next tick instead of waiting
    #[serde(default)]
    pub immediate_processing: bool,
    #[serde(default)]
    pub high_priority: bool,
}

/// Progress of a memory through the pipeline, used for deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    Pending,
    Processing,
    /// Embedded; indexing and storage are tracked by the flags on the entry
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCacheEntry {
    /// Job that owns the current run for this memory
    pub job_id: String,
    pub state: MemoryState,
    pub indexed: bool,
    pub stored: bool,
    pub blob_id: Option<String>,
    pub error: Option<String>,
}

impl MemoryCacheEntry {
    fn pending(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: MemoryState::Pending,
            indexed: false,
            stored: false,
            blob_id: None,
            error: None,
        }
    }
}

/// Payload carried through the three stage queues
#[derive(Debug, Clone)]
pub struct PipelineItem {
    pub job_id: String,
    pub memory: Arc<MemoryInput>,
    pub vector: Option<Arc<Vec<f32>>>,
    immediate: bool,
    priority: Priority,
}

impl PipelineItem {
    fn new(job_id: String, memory: MemoryInput, options: SubmitOptions) -> Self {
        Self {
            job_id,
            memory: Arc::new(memory),
            vector: None,
            immediate: options.immediate_processing,
            priority: if options.high_priority {
                Priority::High
            } else {
                Priority::Normal
            },
        }
    }

    fn with_vector(mut self, vector: Arc<Vec<f32>>) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Key of the embedding cache
    fn content_digest(&self) -> String {
        content_hash(self.memory.content.as_bytes())
    }

    fn into_batch_item(self) -> BatchItem<PipelineItem> {
        let id = self.memory.id.clone();
        let job_id = self.job_id.clone();
        let priority = self.priority;
        BatchItem::new(id, self)
            .with_priority(priority)
            .with_metadata("job_id", job_id)
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            force_immediate: self.immediate,
            high_priority: self.priority == Priority::High,
        }
    }
}

/// Notified synchronously after every indexing batch
pub trait PipelineObserver: Send + Sync {
    fn on_indexed(&self, user_id: &str, memory_ids: &[String]);
}

/// Collaborators the pipeline writes to
#[derive(Clone)]
pub struct PipelineDeps {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn KnowledgeGraph>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn MemoryLedger>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub embedding: SchedulerStats,
    pub indexing: SchedulerStats,
    pub storage: SchedulerStats,
    pub jobs: JobCounts,
    pub memory_cache: CacheStats,
}

struct ManagerInner {
    config: PipelineConfig,
    deps: PipelineDeps,
    retry: RetryPolicy,
    embedding: BatchingService<PipelineItem>,
    indexing: BatchingService<PipelineItem>,
    storage: BatchingService<PipelineItem>,
    memory_cache: BoundedCache<String, MemoryCacheEntry>,
    jobs: JobTracker,
    observers: RwLock<Vec<Arc<dyn PipelineObserver>>>,
}

/// Drives memories through embedding, indexing and storage
///
/// Submissions return a job id right away; the work happens when the stage
/// queues flush. Cloning is cheap and every clone drives the same pipeline.
#[derive(Clone)]
pub struct BatchManager {
    inner: Arc<ManagerInner>,
}

impl BatchManager {
    /// `cache` sizes the per-stage scheduler caches
    pub fn new(config: PipelineConfig, cache: CacheConfig, deps: PipelineDeps) -> Self {
        Self::with_retry_policy(config, cache, deps, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: PipelineConfig,
        cache: CacheConfig,
        deps: PipelineDeps,
        retry: RetryPolicy,
    ) -> Self {
        let scheduler =
            |queue| SchedulerConfig::from_queue(queue, config.max_concurrent, cache);
        let memory_cache = BoundedCache::new(CacheConfig::new(
            config.memory_cache_size,
            Duration::from_secs(config.memory_cache_ttl_secs),
        ));

        let inner = Arc::new(ManagerInner {
            embedding: BatchingService::new(EMBEDDING_QUEUE, scheduler(&config.embedding)),
            indexing: BatchingService::new(INDEXING_QUEUE, scheduler(&config.indexing)),
            storage: BatchingService::new(STORAGE_QUEUE, scheduler(&config.storage)),
            memory_cache,
            jobs: JobTracker::new(),
            observers: RwLock::new(Vec::new()),
            retry,
            deps,
            config,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .embedding
            .register_processor(EMBEDDING_QUEUE, processors::embedding(weak.clone()));
        inner
            .indexing
            .register_processor(INDEXING_QUEUE, processors::indexing(weak.clone()));
        inner
            .storage
            .register_processor(STORAGE_QUEUE, processors::storage(weak));

        Self { inner }
    }

    pub fn with_observer(self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
        self
    }

    /// Submit a memory and return the id of the job tracking it
    ///
    /// A memory already in flight is not enqueued twice; the running job's id
    /// is returned instead. A memory that already embedded is answered from
    /// the memory cache with a fresh, completed job. Failed memories are
    /// resubmitted.
    pub fn add_memory_to_pipeline(&self, memory: MemoryInput, options: SubmitOptions) -> Result<String> {
        memory.validate()?;

        let inner = &self.inner;
        let job_id = Uuid::new_v4().to_string();
        let existing = inner
            .memory_cache
            .get_or_insert_with(memory.id.clone(), || MemoryCacheEntry::pending(&job_id));

        if existing.job_id != job_id {
            match existing.state {
                MemoryState::Completed => {
                    inner.jobs.create_cached(&job_id, &memory.id, &memory.user_id);
                    debug!(memory_id = %memory.id, job_id, "Memory already processed");
                    return Ok(job_id);
                }
                MemoryState::Pending | MemoryState::Processing => {
                    debug!(memory_id = %memory.id, job_id = %existing.job_id, "Memory already in flight");
                    return Ok(existing.job_id);
                }
                MemoryState::Failed => {
                    let mut resubmitted = false;
                    inner.memory_cache.update(&memory.id, |entry| {
                        if entry.state == MemoryState::Failed {
                            *entry = MemoryCacheEntry::pending(&job_id);
                            resubmitted = true;
                        }
                    });
                    if !resubmitted {
                        match inner.memory_cache.get(&memory.id) {
                            Some(current) => return Ok(current.job_id),
                            None => inner
                                .memory_cache
                                .set(memory.id.clone(), MemoryCacheEntry::pending(&job_id)),
                        }
                    }
                    info!(memory_id = %memory.id, job_id, "Resubmitting failed memory");
                }
            }
        }

        inner.jobs.create(&job_id, &memory.id, &memory.user_id);
        let item = PipelineItem::new(job_id.clone(), memory, options);
        let options = item.batch_options();
        let failed = item.clone();
        if let Err(e) = inner
            .embedding
            .add_to_batch(EMBEDDING_QUEUE, item.into_batch_item(), options)
        {
            inner.fail_item(&failed, JobStage::Embedding, &e.to_string());
            return Err(e);
        }
        Ok(job_id)
    }

    /// Flush all three stage queues concurrently
    ///
    /// Items forwarded by a stage during this call land in the next queue and
    /// are not flushed by it; use `drain` to run everything to completion.
    pub async fn process_all_batches(&self) -> Result<usize> {
        let inner = &self.inner;
        let (embedded, indexed, stored) = tokio::join!(
            inner.embedding.process_batch_now(EMBEDDING_QUEUE),
            inner.indexing.process_batch_now(INDEXING_QUEUE),
            inner.storage.process_batch_now(STORAGE_QUEUE),
        );
        Ok(embedded? + indexed? + stored?)
    }

    /// Flush repeatedly until every queue is empty and no job is still running
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            total += self.process_all_batches().await?;
            if self.queued() == 0 && self.inner.jobs.counts().active() == 0 {
                return Ok(total);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Items waiting in any stage queue
    pub fn queued(&self) -> usize {
        self.inner.embedding.total_queued()
            + self.inner.indexing.total_queued()
            + self.inner.storage.total_queued()
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.jobs.get(job_id)
    }

    pub async fn await_job(&self, job_id: &str, timeout: Duration) -> Result<JobStatus> {
        self.inner.jobs.await_job(job_id, timeout).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.jobs.subscribe()
    }

    pub fn memory_state(&self, memory_id: &str) -> Option<MemoryCacheEntry> {
        self.inner.memory_cache.get(memory_id)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            embedding: self.inner.embedding.stats(),
            indexing: self.inner.indexing.stats(),
            storage: self.inner.storage.stats(),
            jobs: self.inner.jobs.counts(),
            memory_cache: self.inner.memory_cache.stats(),
        }
    }

    /// Forget terminal jobs older than the configured retention
    pub fn prune_finished(&self) -> usize {
        let pruned = self
            .inner
            .jobs
            .prune_finished(Duration::from_secs(self.inner.config.job_retention_secs));
        if pruned > 0 {
            debug!(pruned, "Pruned finished jobs");
        }
        pruned
    }

    /// Background TTL sweeps for the memory cache and every stage cache
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.inner.memory_cache.spawn_sweeper(),
            self.inner.embedding.spawn_cache_sweeper(),
            self.inner.indexing.spawn_cache_sweeper(),
            self.inner.storage.spawn_cache_sweeper(),
        ]
    }

    /// Run all queued work to completion and stop the stage timers
    pub async fn shutdown(&self) -> Result<usize> {
        let processed = self.drain().await?;
        for service in [&self.inner.embedding, &self.inner.indexing, &self.inner.storage] {
            service.shutdown().await?;
        }
        info!(processed, "Pipeline shut down");
        Ok(processed)
    }
}

impl ManagerInner {
    /// Apply `update` to the memory's cache entry if `item` still owns it
    fn update_memory(&self, item: &PipelineItem, update: impl FnOnce(&mut MemoryCacheEntry)) {
        self.memory_cache.update(&item.memory.id, |entry| {
            if entry.job_id == item.job_id {
                update(entry);
            }
        });
    }

    fn fail_item(&self, item: &PipelineItem, stage: JobStage, error: &str) {
        error!(
            memory_id = %item.memory.id,
            job_id = %item.job_id,
            ?stage,
            error,
            "Pipeline item failed"
        );
        self.jobs.fail(&item.job_id, stage, error);
        self.update_memory(item, |entry| {
            entry.state = MemoryState::Failed;
            entry.error = Some(error.to_string());
        });
    }

    /// Hand an item to the next stage queue
    fn forward(
        &self,
        service: &BatchingService<PipelineItem>,
        queue: &str,
        stage: JobStage,
        item: PipelineItem,
    ) {
        self.jobs.advance_stage(&item.job_id, stage);
        let options = item.batch_options();
        let failed = item.clone();
        if let Err(e) = service.add_to_batch(queue, item.into_batch_item(), options) {
            self.fail_item(&failed, stage, &e.to_string());
        }
    }

    fn observers(&self) -> Vec<Arc<dyn PipelineObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryKnowledgeGraph, InMemoryLedger, InMemoryVectorIndex};
    use crate::testing::{HashEmbedder, MemoryBlobStore};

    fn manager() -> BatchManager {
        BatchManager::with_retry_policy(
            PipelineConfig::default(),
            CacheConfig::new(100, Duration::from_secs(60)),
            PipelineDeps {
                embedder: Arc::new(HashEmbedder::new()),
                index: Arc::new(InMemoryVectorIndex::default()),
                graph: Arc::new(InMemoryKnowledgeGraph::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                ledger: Arc::new(InMemoryLedger::new()),
            },
            RetryPolicy::none(),
        )
    }

    #[tokio::test]
    async fn test_item_whose_job_cannot_start_is_released() {
        let manager = manager();
        let input = MemoryInput::new("m1", "u1", "hello there");
        let job_id = manager
            .add_memory_to_pipeline(input.clone(), SubmitOptions::default())
            .unwrap();
        // The job ends while its item is still queued
        manager
            .inner
            .jobs
            .transition(&job_id, JobState::Failed, Some("cancelled".into()))
            .unwrap();
        manager.drain().await.unwrap();

        let entry = manager.memory_state("m1").unwrap();
        assert_eq!(entry.state, MemoryState::Failed);
        assert!(entry.error.is_some());
        assert!(!entry.indexed);

        let retry = manager
            .add_memory_to_pipeline(input, SubmitOptions::default())
            .unwrap();
        assert_ne!(retry, job_id);
        manager.drain().await.unwrap();
        assert_eq!(manager.job_status(&retry).unwrap().state, JobState::Completed);
    }

    #[test]
    fn test_validation() {
        assert!(MemoryInput::new("m1", "u1", "hello").validate().is_ok());
        assert!(matches!(
            MemoryInput::new("", "u1", "hello").validate(),
            Err(RecollectError::Validation(_))
        ));
        assert!(MemoryInput::new("m1", " ", "hello").validate().is_err());
        assert!(MemoryInput::new("m1", "u1", "").validate().is_err());
        assert!(
            MemoryInput::new("m1", "u1", "x")
                .with_importance(11.0)
                .validate()
                .is_err()
        );
        assert!(
            MemoryInput::new("m1", "u1", "x")
                .sealed(Bytes::new(), "abc")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_record_for_sealed_memory_has_no_inline_content() {
        let memory = MemoryInput::new("m1", "u1", "secret")
            .sealed(Bytes::from_static(b"\x01\x02"), "declared-hash");
        let record = memory.to_record();
        assert!(record.encrypted);
        assert_eq!(record.content, None);
        assert_eq!(record.content_hash, "declared-hash");
        assert_eq!(memory.blob_body(), Bytes::from_static(b"\x01\x02"));

        let plain = MemoryInput::new("m2", "u1", "visible").to_record();
        assert!(!plain.encrypted);
        assert_eq!(plain.content.as_deref(), Some("visible"));
        assert_eq!(plain.content_hash, content_hash(b"visible"));
    }

    #[test]
    fn test_memory_input_json_defaults() {
        let memory: MemoryInput = serde_json::from_str(
            r#"{"user_id":"u1","content":"hi","sealed":{"ciphertext":"AQI=","content_hash":"h"}}"#,
        )
        .unwrap();
        assert!(!memory.id.is_empty());
        assert_eq!(memory.category, "general");
        assert_eq!(memory.importance, 5.0);
        assert_eq!(
            memory.sealed.unwrap().ciphertext,
            Bytes::from_static(&[1, 2])
        );
    }
}
