use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::error::Result;

/// Scheduling priority of a queued item; higher variants flush first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One unit of queued work
///
/// Items are built before they are enqueued and never change afterwards.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    id: String,
    payload: T,
    enqueued_at: DateTime<Utc>,
    priority: Priority,
    metadata: HashMap<String, String>,
}

impl<T> BatchItem<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            enqueued_at: Utc::now(),
            priority: Priority::Normal,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Per-call scheduling hints for `add_to_batch`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Flush on the next scheduler tick regardless of queue length
    pub force_immediate: bool,
    /// Enqueue with `Priority::High`
    pub high_priority: bool,
}

impl BatchOptions {
    pub fn immediate() -> Self {
        Self {
            force_immediate: true,
            ..Self::default()
        }
    }
}

/// Callable that processes one chunk of a queue
///
/// A rejected call is not retried and its items are not re-enqueued; the
/// caller that owns the items decides what happens to them.
pub type BatchProcessor<T> =
    Arc<dyn Fn(Vec<BatchItem<T>>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a `BatchProcessor`
pub fn processor<T, F, Fut>(f: F) -> BatchProcessor<T>
where
    F: Fn(Vec<BatchItem<T>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    use futures::FutureExt;
    Arc::new(move |items| f(items).boxed())
}

/// Counters for one scheduler instance
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub batches_processed: u64,
    pub items_processed: u64,
    pub failed_batches: u64,
    pub average_batch_size: f64,
    pub queue_lengths: HashMap<String, usize>,
    pub cache: CacheStats,
}
