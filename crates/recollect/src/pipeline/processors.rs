//! Stage processors registered on the three pipeline queues

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{
    INDEXING_QUEUE, JobStage, JobState, ManagerInner, MemoryState, PipelineItem, STORAGE_QUEUE,
};
use crate::batch::{BatchItem, BatchProcessor, processor};
use crate::collab::MemoryRecord;
use crate::error::{RecollectError, Result};
use crate::retry::retry_with_backoff;

fn stage_processor<F, Fut>(weak: Weak<ManagerInner>, run: F) -> BatchProcessor<PipelineItem>
where
    F: Fn(Arc<ManagerInner>, Vec<PipelineItem>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let run = Arc::new(run);
    processor(move |items: Vec<BatchItem<PipelineItem>>| {
        let weak = weak.clone();
        let run = Arc::clone(&run);
        async move {
            let inner = weak
                .upgrade()
                .ok_or_else(|| RecollectError::Pipeline("pipeline manager dropped".into()))?;
            let items = items.into_iter().map(BatchItem::into_payload).collect();
            run(inner, items).await
        }
    })
}

pub(super) fn embedding(weak: Weak<ManagerInner>) -> BatchProcessor<PipelineItem> {
    stage_processor(weak, |inner, items| async move { inner.embed(items).await })
}

pub(super) fn indexing(weak: Weak<ManagerInner>) -> BatchProcessor<PipelineItem> {
    stage_processor(weak, |inner, items| async move { inner.index(items).await })
}

pub(super) fn storage(weak: Weak<ManagerInner>) -> BatchProcessor<PipelineItem> {
    stage_processor(weak, |inner, items| async move { inner.store(items).await })
}

fn usable(vector: &[f32]) -> bool {
    !vector.is_empty() && vector.iter().all(|v| v.is_finite())
}

impl ManagerInner {
    /// One embedding call for the whole chunk; a bad vector only fails its item
    async fn embed(&self, items: Vec<PipelineItem>) -> Result<()> {
        let mut ready = Vec::with_capacity(items.len());
        let mut fresh = Vec::new();

        for item in items {
            if let Err(e) = self.jobs.transition(&item.job_id, JobState::Processing, None) {
                warn!(
                    memory_id = %item.memory.id,
                    job_id = %item.job_id,
                    error = %e,
                    "Dropping item whose job cannot start"
                );
                // Release the memory so it can be submitted again
                self.update_memory(&item, |entry| {
                    entry.state = MemoryState::Failed;
                    entry.error = Some(e.to_string());
                });
                continue;
            }
            self.update_memory(&item, |entry| entry.state = MemoryState::Processing);

            let cached = self
                .embedding
                .cached(&item.content_digest())
                .and_then(|hit| hit.vector);
            match cached {
                Some(vector) => {
                    debug!(memory_id = %item.memory.id, "Embedding cache hit");
                    ready.push(item.with_vector(vector));
                }
                None => fresh.push(item),
            }
        }

        if !fresh.is_empty() {
            let texts: Vec<String> = fresh.iter().map(|i| i.memory.content.clone()).collect();
            let embedder = &self.deps.embedder;
            let result = retry_with_backoff(&self.retry, "embedding batch", || {
                embedder.embed_batch(&texts)
            })
            .await;

            match result {
                Ok(vectors) => {
                    if vectors.len() != fresh.len() {
                        warn!(
                            expected = fresh.len(),
                            got = vectors.len(),
                            "Embedder returned a different number of vectors"
                        );
                    }
                    let mut vectors = vectors.into_iter();
                    for item in fresh {
                        match vectors.next() {
                            Some(vector) if usable(&vector) => {
                                let vector = Arc::new(vector);
                                self.embedding
                                    .cache_value(item.content_digest(), item.clone().with_vector(vector.clone()));
                                ready.push(item.with_vector(vector));
                            }
                            _ => self.fail_item(&item, JobStage::Embedding, "no embedding produced"),
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for item in &fresh {
                        self.fail_item(item, JobStage::Embedding, &message);
                    }
                }
            }
        }

        debug!(count = ready.len(), "Embedded batch");
        for item in ready {
            self.update_memory(&item, |entry| entry.state = MemoryState::Completed);
            self.forward(&self.indexing, INDEXING_QUEUE, JobStage::Indexing, item);
        }
        Ok(())
    }

    /// Buffer every vector, link entities, then commit the index once
    async fn index(&self, items: Vec<PipelineItem>) -> Result<()> {
        let index = &self.deps.index;
        let mut added = Vec::with_capacity(items.len());

        for item in items {
            let Some(vector) = item.vector.clone() else {
                self.fail_item(&item, JobStage::Indexing, "missing embedding");
                continue;
            };
            let memory = &item.memory;
            let record = memory.to_record();
            let result = retry_with_backoff(&self.retry, "index write", || {
                index.add_vector_batched(&memory.user_id, &memory.id, vector.to_vec(), record.clone())
            })
            .await;
            if let Err(e) = result {
                self.fail_item(&item, JobStage::Indexing, &e.to_string());
                continue;
            }

            if !memory.entities.is_empty() {
                if let Err(e) = self
                    .deps
                    .graph
                    .link_entities(&memory.user_id, &memory.id, &memory.entities)
                    .await
                {
                    warn!(memory_id = %memory.id, error = %e, "Failed to link entities");
                }
            }
            added.push(item);
        }

        if added.is_empty() {
            return Ok(());
        }

        let flushed = retry_with_backoff(&self.retry, "index flush", || {
            index.force_flush("indexing batch")
        })
        .await;
        if let Err(e) = flushed {
            let message = e.to_string();
            for item in &added {
                self.fail_item(item, JobStage::Indexing, &message);
            }
            return Ok(());
        }

        let mut by_user: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for item in &added {
            self.update_memory(item, |entry| entry.indexed = true);
            by_user
                .entry(item.memory.user_id.as_str())
                .or_default()
                .push(item.memory.id.clone());
        }
        let observers = self.observers();
        for (user_id, memory_ids) in &by_user {
            for observer in &observers {
                observer.on_indexed(user_id, memory_ids);
            }
        }
        info!(count = added.len(), users = by_user.len(), "Indexed batch");

        for item in added {
            self.forward(&self.storage, STORAGE_QUEUE, JobStage::Storage, item);
        }
        Ok(())
    }

    async fn store(&self, items: Vec<PipelineItem>) -> Result<()> {
        let stored = join_all(items.iter().map(|item| self.store_one(item))).await;
        let ok = stored.iter().filter(|s| **s).count();
        info!(stored = ok, failed = stored.len() - ok, "Stored batch");
        Ok(())
    }

    /// Upload the blob and record it on the ledger
    ///
    /// A failure here fails the job but leaves the index entry in place.
    async fn store_one(&self, item: &PipelineItem) -> bool {
        let memory = &item.memory;
        let body = memory.blob_body();
        let blobs = &self.deps.blobs;
        let blob_id = match retry_with_backoff(&self.retry, "blob upload", || blobs.upload(body.clone())).await {
            Ok(id) => id,
            Err(e) => {
                self.fail_item(item, JobStage::Storage, &e.to_string());
                return false;
            }
        };

        let record = MemoryRecord {
            blob_id: Some(blob_id.clone()),
            ..memory.to_record()
        };
        let ledger = &self.deps.ledger;
        match retry_with_backoff(&self.retry, "ledger write", || ledger.record_memory(&record)).await {
            Ok(digest) => {
                self.update_memory(item, |entry| {
                    entry.stored = true;
                    entry.blob_id = Some(blob_id);
                });
                if let Err(e) = self.jobs.transition(&item.job_id, JobState::Completed, None) {
                    warn!(job_id = %item.job_id, error = %e, "Could not complete job");
                }
                debug!(memory_id = %memory.id, digest, "Memory stored");
                true
            }
            Err(e) => {
                self.fail_item(item, JobStage::Storage, &e.to_string());
                false
            }
        }
    }
}
