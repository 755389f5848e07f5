use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::batch::types::{BatchItem, BatchOptions, BatchProcessor, Priority, SchedulerStats};
use crate::cache::{BoundedCache, CacheConfig};
use crate::config::QueueConfig;
use crate::error::{RecollectError, Result};

/// Thresholds for one scheduler instance
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Queue length that triggers a flush on the next tick, and the chunk
    /// size handed to the processor
    pub max_batch_size: usize,
    /// Delay after the first item of a partial batch before it is flushed
    pub batch_delay: Duration,
    /// Processor calls allowed in flight at once
    pub max_concurrent: usize,
    pub cache: CacheConfig,
}

impl SchedulerConfig {
    pub fn from_queue(queue: &QueueConfig, max_concurrent: usize, cache: CacheConfig) -> Self {
        Self {
            max_batch_size: queue.max_batch_size.max(1),
            batch_delay: queue.batch_delay(),
            max_concurrent: max_concurrent.max(1),
            cache,
        }
    }
}

struct QueueState<T> {
    items: Vec<BatchItem<T>>,
    // Pending delay timer and the generation that armed it
    timer: Option<(u64, JoinHandle<()>)>,
    flush_scheduled: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            timer: None,
            flush_scheduled: false,
        }
    }
}

#[derive(Default)]
struct Counters {
    batches_processed: u64,
    items_processed: u64,
    failed_batches: u64,
}

struct SchedulerInner<T> {
    name: String,
    config: SchedulerConfig,
    queues: Mutex<HashMap<String, QueueState<T>>>,
    processors: RwLock<HashMap<String, BatchProcessor<T>>>,
    permits: Arc<Semaphore>,
    cache: BoundedCache<String, T>,
    counters: Mutex<Counters>,
    next_timer: AtomicU64,
}

/// Accumulates typed work per named queue and flushes it in batches
///
/// A queue flushes on the next scheduler tick once it reaches
/// `max_batch_size` (or when an item asks for it), otherwise `batch_delay`
/// after the first item of the pending batch arrived. Each flush takes the
/// whole queue; processing happens in `max_batch_size` chunks with at most
/// `max_concurrent` processor calls in flight.
pub struct BatchingService<T> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T> Clone for BatchingService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BatchingService<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                cache: BoundedCache::new(config.cache),
                config,
                queues: Mutex::new(HashMap::new()),
                processors: RwLock::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState<T>>> {
        self.inner.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn processor(&self, queue: &str) -> Option<BatchProcessor<T>> {
        self.inner
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .cloned()
    }

    /// Register the single processor for `queue`, replacing any previous one
    pub fn register_processor(&self, queue: impl Into<String>, processor: BatchProcessor<T>) {
        self.inner
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(queue.into(), processor);
    }

    /// Enqueue an item and apply the scheduling policy
    pub fn add_to_batch(&self, queue: &str, item: BatchItem<T>, options: BatchOptions) -> Result<()> {
        if self.processor(queue).is_none() {
            return Err(RecollectError::Pipeline(format!(
                "No processor registered for {}/{queue}",
                self.inner.name
            )));
        }

        let item = if options.high_priority {
            item.with_priority(Priority::High)
        } else {
            item
        };

        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();
        state.items.push(item);
        // Stable: equal priorities keep insertion order
        state.items.sort_by(|a, b| b.priority().cmp(&a.priority()));

        let len = state.items.len();
        if options.force_immediate || len >= self.inner.config.max_batch_size {
            if !state.flush_scheduled {
                state.flush_scheduled = true;
                self.spawn_next_tick_flush(queue);
            }
        } else if state.timer.is_none() {
            let generation = self.inner.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
            let handle = self.spawn_delay_timer(queue, generation);
            state.timer = Some((generation, handle));
        }

        debug!(scheduler = %self.inner.name, queue, len, "Item enqueued");
        Ok(())
    }

    fn spawn_next_tick_flush(&self, queue: &str) {
        let weak = Arc::downgrade(&self.inner);
        let queue = queue.to_string();
        tokio::spawn(async move {
            // Never flush re-entrantly from inside add_to_batch
            tokio::task::yield_now().await;
            Self::flush_in_background(weak, &queue).await;
        });
    }

    fn spawn_delay_timer(&self, queue: &str, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let queue = queue.to_string();
        let delay = self.inner.config.batch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut queues = inner.queues.lock().unwrap_or_else(|e| e.into_inner());
                let Some(state) = queues.get_mut(&queue) else {
                    return;
                };
                if state.timer.as_ref().map(|(armed, _)| *armed) != Some(generation) {
                    return;
                }
                // Detach ourselves so the flush does not abort this task
                state.timer = None;
            }
            Self::flush_in_background(Arc::downgrade(&inner), &queue).await;
        })
    }

    async fn flush_in_background(weak: Weak<SchedulerInner<T>>, queue: &str) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let service = BatchingService { inner };
        if let Err(e) = service.process_batch_now(queue).await {
            error!(scheduler = %service.inner.name, queue, error = %e, "Background batch flush failed");
        }
    }

    /// Snapshot and clear `queue`, then run its processor over the snapshot
    ///
    /// Returns how many items were taken. The queue is already empty when a
    /// processor error propagates, and failed items are not re-enqueued.
    pub async fn process_batch_now(&self, queue: &str) -> Result<usize> {
        let processor = self.processor(queue).ok_or_else(|| {
            RecollectError::Pipeline(format!(
                "No processor registered for {}/{queue}",
                self.inner.name
            ))
        })?;

        let items = {
            let mut queues = self.queues();
            let Some(state) = queues.get_mut(queue) else {
                return Ok(0);
            };
            state.flush_scheduled = false;
            if let Some((_, handle)) = state.timer.take() {
                handle.abort();
            }
            std::mem::take(&mut state.items)
        };

        if items.is_empty() {
            return Ok(0);
        }

        let total = items.len();
        let chunk_size = self.inner.config.max_batch_size;
        let mut chunks: Vec<Vec<BatchItem<T>>> = Vec::new();
        let mut remaining = items.into_iter().peekable();
        while remaining.peek().is_some() {
            chunks.push(remaining.by_ref().take(chunk_size).collect());
        }

        debug!(
            scheduler = %self.inner.name,
            queue,
            items = total,
            chunks = chunks.len(),
            "Processing batch"
        );

        let runs = chunks.into_iter().map(|chunk| {
            let permits = Arc::clone(&self.inner.permits);
            let processor = Arc::clone(&processor);
            async move {
                let size = chunk.len();
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| RecollectError::Pipeline("Scheduler is shut down".to_string()))?;
                processor(chunk).await.map(|_| size)
            }
        });
        let results = join_all(runs).await;

        let mut first_error = None;
        {
            let mut counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
            for result in results {
                match result {
                    Ok(size) => {
                        counters.batches_processed += 1;
                        counters.items_processed += size as u64;
                    }
                    Err(e) => {
                        counters.failed_batches += 1;
                        warn!(scheduler = %self.inner.name, queue, error = %e, "Batch processor failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues().get(queue).map(|s| s.items.len()).unwrap_or(0)
    }

    /// Items waiting across every queue
    pub fn total_queued(&self) -> usize {
        self.queues().values().map(|s| s.items.len()).sum()
    }

    /// Names of queues that currently hold items
    pub fn non_empty_queues(&self) -> Vec<String> {
        self.queues()
            .iter()
            .filter(|(_, s)| !s.items.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether a timer is armed for `queue`
    pub fn has_pending_timer(&self, queue: &str) -> bool {
        self.queues()
            .get(queue)
            .is_some_and(|s| s.timer.is_some())
    }

    pub fn cached(&self, key: &str) -> Option<T> {
        self.inner.cache.get(key)
    }

    pub fn cache_value(&self, key: impl Into<String>, value: T) {
        self.inner.cache.set(key.into(), value);
    }

    pub fn invalidate(&self, key: &str) -> Option<T> {
        self.inner.cache.delete(key)
    }

    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.inner.cache.spawn_sweeper()
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        let queue_lengths = self
            .queues()
            .iter()
            .map(|(name, s)| (name.clone(), s.items.len()))
            .collect();
        SchedulerStats {
            batches_processed: counters.batches_processed,
            items_processed: counters.items_processed,
            failed_batches: counters.failed_batches,
            average_batch_size: if counters.batches_processed == 0 {
                0.0
            } else {
                counters.items_processed as f64 / counters.batches_processed as f64
            },
            queue_lengths,
            cache: self.inner.cache.stats(),
        }
    }

    /// Cancel every timer and flush whatever is still queued
    pub async fn shutdown(&self) -> Result<usize> {
        let queues: Vec<String> = {
            let mut queues = self.queues();
            for state in queues.values_mut() {
                if let Some((_, handle)) = state.timer.take() {
                    handle.abort();
                }
            }
            queues.keys().cloned().collect()
        };

        let mut flushed = 0;
        for queue in queues {
            flushed += self.process_batch_now(&queue).await?;
        }
        debug!(scheduler = %self.inner.name, flushed, "Scheduler shut down");
        Ok(flushed)
    }
}
