use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::collab::{MemoryRecord, SearchParams, VectorHit, VectorIndex, cosine_similarity};
use crate::error::Result;

/// Buffered writes are committed automatically once this many accumulate
pub const DEFAULT_AUTO_FLUSH_THRESHOLD: usize = 256;

#[derive(Debug, Clone)]
struct IndexedVector {
    vector: Vec<f32>,
    record: MemoryRecord,
}

#[derive(Debug)]
struct PendingWrite {
    user_id: String,
    id: String,
    entry: IndexedVector,
}

/// Flat cosine index kept in memory, partitioned by user
///
/// Writes are buffered and only become searchable after `force_flush` or
/// once the buffer reaches the auto-flush threshold.
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    committed: DashMap<String, HashMap<String, IndexedVector>>,
    pending: Mutex<Vec<PendingWrite>>,
    auto_flush_threshold: usize,
    search_calls: AtomicUsize,
    flush_calls: AtomicUsize,
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_FLUSH_THRESHOLD)
    }
}

impl InMemoryVectorIndex {
    pub fn new(auto_flush_threshold: usize) -> Self {
        Self {
            committed: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            auto_flush_threshold: auto_flush_threshold.max(1),
            search_calls: AtomicUsize::new(0),
            flush_calls: AtomicUsize::new(0),
        }
    }

    fn commit_pending(&self) -> usize {
        let writes: Vec<PendingWrite> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        let count = writes.len();
        for write in writes {
            self.committed
                .entry(write.user_id)
                .or_default()
                .insert(write.id, write.entry);
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.committed.iter().map(|user| user.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<VectorHit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        let Some(entries) = self.committed.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter_map(|(id, entry)| {
                let similarity = cosine_similarity(vector, &entry.vector);
                if params.threshold.is_some_and(|t| similarity < t) {
                    return None;
                }
                Some(VectorHit {
                    id: id.clone(),
                    distance: 1.0 - similarity,
                    record: entry.record.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(params.k);
        Ok(hits)
    }

    async fn add_vector_batched(
        &self,
        user_id: &str,
        id: &str,
        vector: Vec<f32>,
        record: MemoryRecord,
    ) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push(PendingWrite {
                user_id: user_id.to_string(),
                id: id.to_string(),
                entry: IndexedVector { vector, record },
            });
            pending.len() >= self.auto_flush_threshold
        };

        if should_flush {
            let flushed = self.commit_pending();
            debug!(flushed, "Auto-flushed vector index buffer");
        }
        Ok(())
    }

    async fn force_flush(&self, reason: &str) -> Result<usize> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        let flushed = self.commit_pending();
        debug!(flushed, reason, "Flushed vector index");
        Ok(flushed)
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self
            .committed
            .get(user_id)
            .and_then(|entries| entries.get(id).map(|e| e.record.clone())))
    }
}
