//! Admin surface for monitoring a running daemon
//!
//! Provides the statistics summary served at `/admin/stats` and the job event
//! stream served at `/admin/events`.

pub mod handlers;

use serde::{Deserialize, Serialize};

use crate::batch::SchedulerStats;
use crate::decrypt::DecryptionStats;
use crate::pipeline::{EMBEDDING_QUEUE, INDEXING_QUEUE, JobCounts, PipelineStats, STORAGE_QUEUE};
use crate::retrieval::RetrievalCacheStats;

/// Counters for one pipeline stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub name: String,
    pub queued: usize,
    pub batches_processed: u64,
    pub items_processed: u64,
    pub failed_batches: u64,
    pub average_batch_size: f64,
}

impl StageStats {
    fn from_scheduler(name: &str, stats: &SchedulerStats) -> Self {
        Self {
            name: name.to_string(),
            queued: stats.queue_lengths.values().sum(),
            batches_processed: stats.batches_processed,
            items_processed: stats.items_processed,
            failed_batches: stats.failed_batches,
            average_batch_size: stats.average_batch_size,
        }
    }
}

/// Statistics about the daemon's current state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonStats {
    pub uptime_secs: u64,
    /// Embedding, indexing and storage, in pipeline order
    pub stages: Vec<StageStats>,
    pub jobs: JobCounts,
    pub memory_cache_size: usize,
    pub query_cache_size: usize,
    pub query_cache_hit_rate: f64,
    /// Absent when no key servers are configured
    pub decryption: Option<DecryptionSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecryptionSummary {
    pub session_keys: usize,
    pub decryptions: u64,
    pub cache_hits: u64,
    pub integrity_failures: u64,
    pub access_denied: u64,
    pub healthy_key_servers: usize,
    pub key_servers: usize,
}

impl From<&DecryptionStats> for DecryptionSummary {
    fn from(stats: &DecryptionStats) -> Self {
        Self {
            session_keys: stats.session_keys,
            decryptions: stats.decryptions,
            cache_hits: stats.cache_hits,
            integrity_failures: stats.integrity_failures,
            access_denied: stats.access_denied,
            healthy_key_servers: stats.key_servers.iter().filter(|s| s.healthy).count(),
            key_servers: stats.key_servers.len(),
        }
    }
}

impl DaemonStats {
    pub fn collect(
        uptime_secs: u64,
        pipeline: &PipelineStats,
        retrieval: &RetrievalCacheStats,
        decryption: Option<&DecryptionStats>,
    ) -> Self {
        Self {
            uptime_secs,
            stages: vec![
                StageStats::from_scheduler(EMBEDDING_QUEUE, &pipeline.embedding),
                StageStats::from_scheduler(INDEXING_QUEUE, &pipeline.indexing),
                StageStats::from_scheduler(STORAGE_QUEUE, &pipeline.storage),
            ],
            jobs: pipeline.jobs.clone(),
            memory_cache_size: pipeline.memory_cache.size,
            query_cache_size: retrieval.query.size,
            query_cache_hit_rate: retrieval.query.hit_rate,
            decryption: decryption.map(DecryptionSummary::from),
        }
    }

    pub fn queued(&self) -> usize {
        self.stages.iter().map(|s| s.queued).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::decrypt::KeyServerStats;

    fn scheduler(queued: usize, batches: u64) -> SchedulerStats {
        let mut stats = SchedulerStats {
            batches_processed: batches,
            ..Default::default()
        };
        stats.queue_lengths.insert("q".to_string(), queued);
        stats
    }

    #[test]
    fn test_collect_summarises_every_component() {
        let pipeline = PipelineStats {
            embedding: scheduler(2, 1),
            indexing: scheduler(0, 3),
            storage: scheduler(1, 0),
            jobs: JobCounts {
                pending: 3,
                ..Default::default()
            },
            memory_cache: CacheStats {
                size: 4,
                ..Default::default()
            },
        };
        let retrieval = RetrievalCacheStats {
            query: CacheStats {
                size: 2,
                hit_rate: 0.5,
                ..Default::default()
            },
            content: CacheStats::default(),
            analytics: CacheStats::default(),
            query_embeddings: 1,
        };
        let decryption = DecryptionStats {
            session_keys: 1,
            decryptions: 5,
            cache_hits: 2,
            integrity_failures: 1,
            access_denied: 0,
            content_cache: CacheStats::default(),
            key_servers: vec![
                KeyServerStats {
                    name: "a".into(),
                    requests: 0,
                    successes: 0,
                    failures: 0,
                    consecutive_failures: 0,
                    average_latency_ms: 0.0,
                    success_rate: 1.0,
                    healthy: true,
                },
                KeyServerStats {
                    name: "b".into(),
                    requests: 3,
                    successes: 0,
                    failures: 3,
                    consecutive_failures: 3,
                    average_latency_ms: 0.0,
                    success_rate: 0.0,
                    healthy: false,
                },
            ],
        };

        let stats = DaemonStats::collect(10, &pipeline, &retrieval, Some(&decryption));
        assert_eq!(stats.queued(), 3);
        assert_eq!(stats.stages[1].name, "indexing");
        assert_eq!(stats.stages[1].batches_processed, 3);
        assert_eq!(stats.query_cache_hit_rate, 0.5);
        let summary = stats.decryption.unwrap();
        assert_eq!((summary.healthy_key_servers, summary.key_servers), (1, 2));
    }

    #[test]
    fn test_daemon_stats_json_roundtrip() {
        let stats = DaemonStats {
            uptime_secs: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: DaemonStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }
}
