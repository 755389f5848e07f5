//! Per-user session key pool

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::InFlight;
use crate::collab::{SessionKey, SessionKeyIssuer};
use crate::error::Result;

struct PooledKey {
    key: SessionKey,
    created_at: Instant,
    // Breaks ties between keys created in the same instant
    sequence: u64,
}

struct PoolState {
    keys: HashMap<String, PooledKey>,
    next_sequence: u64,
}

struct PoolInner {
    issuer: Arc<dyn SessionKeyIssuer>,
    state: Mutex<PoolState>,
    max_keys: usize,
    ttl: Duration,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_key(&self, user_id: &str) -> Option<SessionKey> {
        let mut state = self.state();
        let expired = match state.keys.get(user_id) {
            Some(pooled) if pooled.created_at.elapsed() <= self.ttl => {
                return Some(pooled.key.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.keys.remove(user_id);
            debug!(user_id, "Session key expired");
        }
        None
    }

    /// Insert, evicting oldest-created keys first while the pool is full
    fn insert(&self, key: SessionKey) {
        let mut state = self.state();
        state.keys.remove(&key.user_id);
        while state.keys.len() >= self.max_keys {
            let oldest = state
                .keys
                .iter()
                .min_by_key(|(_, pooled)| (pooled.created_at, pooled.sequence))
                .map(|(user, _)| user.clone());
            match oldest {
                Some(user) => {
                    state.keys.remove(&user);
                    debug!(user_id = %user, "Evicted oldest session key");
                }
                None => break,
            }
        }
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.keys.insert(
            key.user_id.clone(),
            PooledKey {
                key,
                created_at: Instant::now(),
                sequence,
            },
        );
    }

    fn sweep(&self) -> usize {
        let mut state = self.state();
        let before = state.keys.len();
        let ttl = self.ttl;
        state.keys.retain(|_, pooled| pooled.created_at.elapsed() <= ttl);
        before - state.keys.len()
    }
}

/// Caps the number of live session keys and expires them by age
///
/// Keys are evicted oldest-created first, never by recency of use.
/// Concurrent requests for a user without a key share one issuer call.
pub struct SessionKeyPool {
    inner: Arc<PoolInner>,
    creating: InFlight<String, SessionKey>,
}

impl SessionKeyPool {
    pub fn new(issuer: Arc<dyn SessionKeyIssuer>, max_keys: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                issuer,
                state: Mutex::new(PoolState {
                    keys: HashMap::new(),
                    next_sequence: 0,
                }),
                max_keys: max_keys.max(1),
                ttl,
            }),
            creating: InFlight::new(),
        }
    }

    pub async fn get_or_create(&self, user_id: &str) -> Result<SessionKey> {
        if let Some(key) = self.inner.live_key(user_id) {
            return Ok(key);
        }

        let inner = Arc::clone(&self.inner);
        let user = user_id.to_string();
        self.creating
            .run(user_id.to_string(), move || async move {
                let key = inner.issuer.create_session_key(&user).await?;
                inner.insert(key.clone());
                debug!(user_id = %user, "Created session key");
                Ok(key)
            })
            .await
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.inner.state().keys.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.state().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    /// Background TTL sweep; exits once the pool is dropped
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired session keys");
                }
            }
        })
    }
}
