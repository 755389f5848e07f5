//! Size- and TTL-bounded caching primitives
//!
//! `BoundedCache` is the one cache type used by every component. Each
//! component creates and owns its instances; nothing is shared across
//! component boundaries. `InFlight` deduplicates concurrent identical
//! operations on top of it.

mod inflight;

pub use inflight::InFlight;

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default interval between background TTL sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Fraction of capacity evicted when an insert finds the cache full
const EVICTION_FRACTION: f64 = 0.1;

/// Limits for one cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_size: usize,
    /// Entries older than this (measured from insertion) are misses
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// How often `spawn_sweeper` purges expired entries
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl CacheConfig {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0.0 before the first lookup
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_size_hint: usize,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size_hint: usize,
    // Monotonic touch counter; orders entries whose instants are equal
    touched: u64,
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> CacheInner<K, V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// A key→value store bounded by entry count and age
///
/// Reads treat entries older than the TTL as misses and remove them. Writes
/// into a full cache first evict the `⌈max_size × 0.1⌉` least recently
/// accessed entries.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    inner: Arc<Mutex<CacheInner<K, V>>>,
    config: CacheConfig,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, created_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created_at) > self.config.ttl
    }

    /// Look up a live entry, updating its access bookkeeping
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => self.is_expired(entry.created_at, now),
        };

        if expired {
            inner.entries.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        let touched = inner.tick();
        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        entry.touched = touched;
        Some(entry.value.clone())
    }

    /// Presence check that honours the TTL but does not count as a lookup
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|e| !self.is_expired(e.created_at, now))
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_size(key, value, 0);
    }

    /// Insert or replace an entry, recording an approximate byte size
    pub fn set_with_size(&self, key: K, value: V, size_hint: usize) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.insert_locked(&mut inner, key, value, size_hint, now);
    }

    fn insert_locked(
        &self,
        inner: &mut CacheInner<K, V>,
        key: K,
        value: V,
        size_hint: usize,
        now: Instant,
    ) {
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_size {
            self.evict_locked(inner);
        }

        let touched = inner.tick();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                size_hint,
                touched,
            },
        );
    }

    fn evict_locked(&self, inner: &mut CacheInner<K, V>) {
        let count = eviction_count(self.config.max_size).min(inner.entries.len());
        if count == 0 {
            return;
        }

        let mut ranked: Vec<(Instant, u64, K)> = inner
            .entries
            .iter()
            .map(|(k, e)| (e.last_accessed, e.touched, k.clone()))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, _, key) in ranked.into_iter().take(count) {
            inner.entries.remove(&key);
        }
        inner.evictions += count as u64;
        debug!(evicted = count, "Cache at capacity, evicted oldest entries");
    }

    /// Return the live value for `key`, or insert the one produced by `make`
    ///
    /// The lookup and the insert happen under one lock, so concurrent callers
    /// observe a single winner.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let mut inner = self.lock();

        let live = inner
            .entries
            .get(&key)
            .map(|e| !self.is_expired(e.created_at, now));

        match live {
            Some(true) => {
                let touched = inner.tick();
                if let Some(entry) = inner.entries.get_mut(&key) {
                    entry.last_accessed = now;
                    entry.access_count += 1;
                    entry.touched = touched;
                    let value = entry.value.clone();
                    inner.hits += 1;
                    return value;
                }
            }
            Some(false) => {
                inner.entries.remove(&key);
                inner.expirations += 1;
            }
            None => {}
        }

        inner.misses += 1;
        let value = make();
        self.insert_locked(&mut inner, key, value.clone(), 0, now);
        value
    }

    /// Apply `update` to a live entry in place, keeping its age
    ///
    /// Returns false when the key is absent or expired.
    pub fn update<Q, F>(&self, key: &Q, update: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        let now = Instant::now();
        let mut inner = self.lock();
        let ttl = self.config.ttl;
        match inner.entries.get_mut(key) {
            Some(entry) if now.saturating_duration_since(entry.created_at) <= ttl => {
                update(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.remove(key).map(|e| e.value)
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, e| keep(k, &e.value));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry past its TTL, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.saturating_duration_since(e.created_at) <= ttl);
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Start a background task that sweeps expired entries every
    /// `sweep_interval`
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<Mutex<CacheInner<K, V>>> = Arc::downgrade(&self.inner);
        let config = self.config;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = BoundedCache { inner, config };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let requests = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.config.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if requests == 0 {
                0.0
            } else {
                inner.hits as f64 / requests as f64
            },
            evictions: inner.evictions,
            expirations: inner.expirations,
            total_size_hint: inner.entries.values().map(|e| e.size_hint).sum(),
        }
    }

    /// Access count of a live entry, without touching it
    pub fn access_count<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.get(key).map(|e| e.access_count)
    }
}

/// Number of entries evicted when a cache of `max_size` is full
pub fn eviction_count(max_size: usize) -> usize {
    ((max_size as f64 * EVICTION_FRACTION).ceil() as usize).max(1)
}
