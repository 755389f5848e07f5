use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};

use crate::error::Result;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Pending<K, V> {
    next_generation: u64,
    entries: HashMap<K, (u64, WeakShared<BoxFuture<'static, Result<V>>>)>,
}

/// Keyed table of shared in-flight operations
///
/// The first caller for a key starts the operation; every caller arriving
/// while it is pending awaits the same future and receives a clone of the
/// same result or error. The entry is registered before the operation starts
/// and removed when it finishes, whether it succeeded, failed or was dropped.
/// The table only holds a weak handle: once every caller has gone away the
/// operation is dropped along with its entry.
pub struct InFlight<K, V> {
    pending: Arc<Mutex<Pending<K, V>>>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(Pending {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }
}

impl<K, V> std::fmt::Debug for InFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.entries.len()).unwrap_or(0);
        f.debug_struct("InFlight").field("pending", &pending).finish()
    }
}

/// Removes the entry for `key` once the owning operation is finished,
/// unless a newer operation has already replaced it
struct RemoveOnDrop<K: Eq + Hash, V> {
    pending: Weak<Mutex<Pending<K, V>>>,
    key: Option<K>,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for RemoveOnDrop<K, V> {
    fn drop(&mut self) {
        let (Some(pending), Some(key)) = (self.pending.upgrade(), self.key.take()) else {
            return;
        };
        let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending
            .entries
            .get(&key)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            pending.entries.remove(&key);
        }
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `key`, or join the run already in progress
    pub async fn run<F, Fut>(&self, key: K, operation: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared: SharedResult<V> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let joined = pending
                .entries
                .get(&key)
                .and_then(|(_, weak)| weak.upgrade());
            if let Some(shared) = joined {
                shared
            } else {
                pending.next_generation += 1;
                let generation = pending.next_generation;
                let guard = RemoveOnDrop {
                    pending: Arc::downgrade(&self.pending),
                    key: Some(key.clone()),
                    generation,
                };
                let fut = operation();
                let shared = async move {
                    let _guard = guard;
                    fut.await
                }
                .boxed()
                .shared();
                if let Some(weak) = shared.downgrade() {
                    pending.entries.insert(key, (generation, weak));
                }
                shared
            }
        };

        shared.await
    }

    /// Whether an operation for `key` is currently pending
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending
            .lock()
            .map(|p| p.entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
