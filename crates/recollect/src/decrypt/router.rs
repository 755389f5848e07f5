//! Key-server selection and failover

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::KeyServerStats;
use crate::collab::{KeyServer, SessionKey};
use crate::error::{RecollectError, Result};
use crate::retry::with_timeout;

#[derive(Debug, Default)]
struct EndpointStats {
    requests: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    total_latency_ms: u64,
    // Set by probes only
    probe_failed: bool,
    // When the server last failed while unhealthy
    tripped_at: Option<Instant>,
}

impl EndpointStats {
    fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

struct Endpoint {
    server: Arc<dyn KeyServer>,
    stats: Mutex<EndpointStats>,
}

impl Endpoint {
    fn stats(&self) -> MutexGuard<'_, EndpointStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Routes decrypt calls to the statistically best key server
///
/// Servers are ranked healthy first, then by success rate, then by average
/// latency, then by configuration order. A server is unhealthy after
/// `failover_threshold` consecutive failures or a failed probe; one success
/// makes it healthy again. Once `cooldown` has passed since its last failure
/// an unhealthy server is available for a trial call, and a failed trial
/// restarts the cooldown.
pub struct KeyServerRouter {
    endpoints: Vec<Endpoint>,
    failover_threshold: u32,
    timeout: Duration,
    cooldown: Duration,
}

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

impl KeyServerRouter {
    pub fn new(servers: Vec<Arc<dyn KeyServer>>, failover_threshold: u32, timeout: Duration) -> Self {
        Self {
            endpoints: servers
                .into_iter()
                .map(|server| Endpoint {
                    server,
                    stats: Mutex::new(EndpointStats::default()),
                })
                .collect(),
            failover_threshold: failover_threshold.max(1),
            timeout,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn is_healthy(&self, stats: &EndpointStats) -> bool {
        !stats.probe_failed && stats.consecutive_failures < self.failover_threshold
    }

    /// Healthy, or unhealthy long enough to deserve another try
    fn is_available(&self, stats: &EndpointStats) -> bool {
        self.is_healthy(stats)
            || stats
                .tripped_at
                .is_none_or(|at| at.elapsed() >= self.cooldown)
    }

    pub fn any_healthy(&self) -> bool {
        self.endpoints.iter().any(|e| self.is_healthy(&e.stats()))
    }

    pub fn any_available(&self) -> bool {
        self.endpoints.iter().any(|e| self.is_available(&e.stats()))
    }

    /// Endpoint indices in the order they should be tried
    fn ranked(&self) -> Vec<usize> {
        let mut keyed: Vec<(bool, f64, f64, usize)> = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(order, endpoint)| {
                let stats = endpoint.stats();
                (
                    !self.is_available(&stats),
                    stats.success_rate(),
                    stats.average_latency_ms(),
                    order,
                )
            })
            .collect();
        keyed.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.total_cmp(&a.1))
                .then(a.2.total_cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        keyed.into_iter().map(|(_, _, _, order)| order).collect()
    }

    /// Name of the server the next request would go to first
    pub fn preferred(&self) -> Option<String> {
        self.ranked()
            .first()
            .map(|&i| self.endpoints[i].server.name().to_string())
    }

    fn record(&self, endpoint: &Endpoint, ok: bool, latency: Duration) {
        let mut stats = endpoint.stats();
        stats.requests += 1;
        stats.total_latency_ms += latency.as_millis() as u64;
        if ok {
            stats.successes += 1;
            stats.consecutive_failures = 0;
            stats.probe_failed = false;
            stats.tripped_at = None;
        } else {
            stats.failures += 1;
            stats.consecutive_failures += 1;
            if !self.is_healthy(&stats) {
                stats.tripped_at = Some(Instant::now());
            }
            if stats.consecutive_failures == self.failover_threshold {
                warn!(
                    key_server = endpoint.server.name(),
                    failures = stats.consecutive_failures,
                    "Key server marked unhealthy"
                );
            }
        }
    }

    /// Decrypt on the best server, failing over on retryable errors
    ///
    /// Returns the plaintext and the name of the server that produced it.
    /// Access and decryption errors are returned as-is without trying other
    /// servers.
    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &SessionKey,
        user_id: &str,
    ) -> Result<(Bytes, String)> {
        let mut last_error = None;
        for index in self.ranked() {
            let endpoint = &self.endpoints[index];
            let name = endpoint.server.name();
            let started = Instant::now();
            let result = with_timeout(
                self.timeout,
                "key server decrypt",
                endpoint.server.decrypt(ciphertext, key, user_id),
            )
            .await;
            // Only availability failures count against the server
            let healthy = !matches!(&result, Err(e) if e.is_retryable());
            self.record(endpoint, healthy, started.elapsed());

            match result {
                Ok(plaintext) => return Ok((plaintext, name.to_string())),
                Err(e) if e.is_retryable() => {
                    debug!(key_server = name, error = %e, "Key server failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RecollectError::Config("no key servers configured".to_string())
        }))
    }

    /// Probe every server's health endpoint concurrently
    pub async fn probe(&self) -> Vec<(String, bool)> {
        let probes = self.endpoints.iter().map(|endpoint| async move {
            let available = tokio::time::timeout(self.timeout, endpoint.server.is_available())
                .await
                .unwrap_or(false);
            {
                let mut stats = endpoint.stats();
                stats.probe_failed = !available;
                if available {
                    stats.consecutive_failures = 0;
                    stats.tripped_at = None;
                } else {
                    stats.tripped_at = Some(Instant::now());
                }
            }
            (endpoint.server.name().to_string(), available)
        });
        let results = join_all(probes).await;
        let healthy = results.iter().filter(|(_, ok)| *ok).count();
        info!(healthy, total = results.len(), "Probed key servers");
        results
    }

    /// Health-check every server on a fixed interval until the router is dropped
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.probe().await;
            }
        })
    }

    pub fn stats(&self) -> Vec<KeyServerStats> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let stats = endpoint.stats();
                KeyServerStats {
                    name: endpoint.server.name().to_string(),
                    requests: stats.requests,
                    successes: stats.successes,
                    failures: stats.failures,
                    consecutive_failures: stats.consecutive_failures,
                    average_latency_ms: stats.average_latency_ms(),
                    success_rate: stats.success_rate(),
                    healthy: self.is_healthy(&stats),
                }
            })
            .collect()
    }
}
