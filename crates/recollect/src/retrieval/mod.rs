//! Multi-strategy memory retrieval
//!
//! `MemoryRetrievalService` answers a `UnifiedMemoryQuery` by running one or
//! more search strategies, merging their hits by memory id, fusing the
//! per-signal scores, and post-processing the ranked list (filters, content,
//! analytics, relationships, decryption). Whole contexts are cached per query
//! and identical concurrent queries share one execution.

mod query;
mod result;
mod strategy;

pub use query::{
    DateRange, ImportanceRange, QueryFilters, QueryOptions, SearchType, SimilarityParams,
    UnifiedMemoryQuery,
};
pub use result::{
    DataSource, GRAPH_WEIGHT, KEYWORD_WEIGHT, MemoryAnalytics, PhaseTimings, QualityMetrics,
    RelevanceBreakdown, RetrievalContext, RetrievalStats, SEMANTIC_WEIGHT, TEMPORAL_WEIGHT,
    TimelineEntry, UnifiedMemoryResult, VECTOR_WEIGHT, build_timeline,
};

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{BoundedCache, CacheConfig, CacheStats, InFlight};
use crate::collab::{BlobStore, Embedder, KnowledgeGraph, MemoryLedger, VectorIndex};
use crate::config::{IndexConfig, RetrievalConfig};
use crate::decrypt::MemoryDecryptionPipeline;
use crate::error::{RecollectError, Result};
use crate::pipeline::PipelineObserver;
use crate::retry::RetryPolicy;
use result::merge_results;
use strategy::SearchPlan;

/// Collaborators the retrieval service reads from
#[derive(Clone)]
pub struct RetrievalDeps {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn KnowledgeGraph>,
    pub ledger: Arc<dyn MemoryLedger>,
    pub blobs: Arc<dyn BlobStore>,
    /// Enables auto-decryption of encrypted results
    pub decryption: Option<Arc<MemoryDecryptionPipeline>>,
}

#[derive(Debug, Clone)]
struct CachedContext {
    user_id: String,
    context: RetrievalContext,
}

/// Occupancy and hit rates of the retrieval caches
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalCacheStats {
    pub query: CacheStats,
    pub content: CacheStats,
    pub analytics: CacheStats,
    pub query_embeddings: usize,
}

pub(crate) struct RetrievalInner {
    config: RetrievalConfig,
    default_threshold: f32,
    ef_search: usize,
    deps: RetrievalDeps,
    retry: RetryPolicy,
    query_cache: BoundedCache<String, CachedContext>,
    content_cache: BoundedCache<String, String>,
    analytics_cache: BoundedCache<String, MemoryAnalytics>,
    embeddings: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    in_flight: InFlight<String, RetrievalContext>,
    // Bumped by every invalidation; a search only caches its context if the
    // user's epoch is unchanged since it started
    epochs: DashMap<String, u64>,
}

fn bounded<V>(max_size: usize, ttl_secs: u64) -> BoundedCache<String, V>
where
    V: Clone + Send + 'static,
{
    BoundedCache::new(CacheConfig::new(max_size, Duration::from_secs(ttl_secs)))
}

/// Outcome of the search phase before post-processing
struct StrategyOutcome {
    results: Vec<UnifiedMemoryResult>,
    run: Vec<SearchType>,
    failed: Vec<SearchType>,
}

/// Fused multi-strategy search over a user's memories
#[derive(Clone)]
pub struct MemoryRetrievalService {
    inner: Arc<RetrievalInner>,
}

impl MemoryRetrievalService {
    pub fn new(config: RetrievalConfig, index: &IndexConfig, deps: RetrievalDeps) -> Self {
        Self::with_retry_policy(config, index, deps, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: RetrievalConfig,
        index: &IndexConfig,
        deps: RetrievalDeps,
        retry: RetryPolicy,
    ) -> Self {
        let lru_capacity = NonZeroUsize::new(config.embedding_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(RetrievalInner {
                query_cache: bounded(config.cache_size, config.query_cache_ttl_secs),
                content_cache: bounded(config.cache_size, config.content_cache_ttl_secs),
                analytics_cache: bounded(config.cache_size, config.analytics_cache_ttl_secs),
                embeddings: Mutex::new(LruCache::new(lru_capacity)),
                in_flight: InFlight::new(),
                epochs: DashMap::new(),
                default_threshold: index.default_threshold,
                ef_search: index.ef_search,
                deps,
                retry,
                config,
            }),
        }
    }

    /// Answer `query`, from the query cache when possible
    ///
    /// Identical queries issued while one is executing share its result.
    pub async fn search_memories(&self, query: UnifiedMemoryQuery) -> Result<RetrievalContext> {
        query.validate()?;
        let key = query.cache_key()?;

        if query.options.use_cache {
            if let Some(cached) = self.inner.query_cache.get(&key) {
                debug!(user_id = %query.user_id, "Query cache hit");
                return Ok(cached.context);
            }
        }

        // Searches started before an invalidation never share with later ones
        let epoch = self.inner.epoch(&query.user_id);
        let inner = Arc::clone(&self.inner);
        self.inner
            .in_flight
            .run(format!("{key}@{epoch}"), move || async move {
                inner.execute(query, key, epoch).await
            })
            .await
    }

    /// Drop every cached context for `user_id`, returning how many were
    /// removed
    pub fn invalidate_user(&self, user_id: &str) -> usize {
        *self.inner.epochs.entry(user_id.to_string()).or_insert(0) += 1;
        self.inner.query_cache.retain(|_, cached| cached.user_id != user_id)
    }

    /// Drop every cached context, content and analytics entry
    pub fn clear_caches(&self) {
        self.inner.query_cache.clear();
        self.inner.content_cache.clear();
        self.inner.analytics_cache.clear();
        self.inner.embedding_lru().clear();
    }

    pub fn cache_stats(&self) -> RetrievalCacheStats {
        RetrievalCacheStats {
            query: self.inner.query_cache.stats(),
            content: self.inner.content_cache.stats(),
            analytics: self.inner.analytics_cache.stats(),
            query_embeddings: self.inner.embedding_lru().len(),
        }
    }

    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.inner.query_cache.spawn_sweeper(),
            self.inner.content_cache.spawn_sweeper(),
            self.inner.analytics_cache.spawn_sweeper(),
        ]
    }
}

impl PipelineObserver for MemoryRetrievalService {
    fn on_indexed(&self, user_id: &str, memory_ids: &[String]) {
        let removed = self.invalidate_user(user_id);
        debug!(user_id, indexed = memory_ids.len(), removed, "Invalidated cached queries");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn source_of(strategy: SearchType) -> DataSource {
    match strategy {
        SearchType::Temporal | SearchType::Keyword => DataSource::Chain,
        _ => DataSource::Storage,
    }
}

impl RetrievalInner {
    fn epoch(&self, user_id: &str) -> u64 {
        self.epochs.get(user_id).map(|e| *e).unwrap_or(0)
    }

    fn embedding_lru(&self) -> MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        self.embeddings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn plan(&self, query: &UnifiedMemoryQuery) -> SearchPlan {
        SearchPlan {
            user_id: query.user_id.clone(),
            text: query.query.clone(),
            terms: query.terms(),
            k: query.similarity.k.unwrap_or(self.config.default_k),
            threshold: query.similarity.threshold.unwrap_or(self.default_threshold),
            ef_search: query.similarity.ef_search.unwrap_or(self.ef_search),
            date_range: query.filters.date_range,
        }
    }

    async fn execute(&self, query: UnifiedMemoryQuery, key: String, epoch: u64) -> Result<RetrievalContext> {
        let started = Instant::now();
        let plan = self.plan(&query);
        let options = query.options;
        let mut timings = PhaseTimings::default();
        let mut sources: BTreeSet<DataSource> = BTreeSet::new();

        let phase = Instant::now();
        let outcome = self.dispatch(&plan, query.search_type).await?;
        timings.search_ms = elapsed_ms(phase);
        sources.extend(
            outcome
                .run
                .iter()
                .filter(|s| !outcome.failed.contains(*s))
                .map(|s| source_of(*s)),
        );
        let mut results = outcome.results;

        let phase = Instant::now();
        apply_filters(&mut results, &query.filters);
        timings.filter_ms = elapsed_ms(phase);

        let phase = Instant::now();
        if options.include_content {
            self.load_content(&mut results, &mut sources).await;
        }
        if options.include_relationships {
            self.attach_relationships(&mut results, &plan.user_id).await;
        }
        timings.enrich_ms = elapsed_ms(phase);

        let phase = Instant::now();
        // Stable: ties keep strategy merge order
        results.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        results.truncate(plan.k);
        timings.rank_ms = elapsed_ms(phase);

        let phase = Instant::now();
        let mut decrypted = 0;
        if options.include_content && options.auto_decrypt {
            decrypted = self.auto_decrypt(&mut results, &plan.user_id).await;
            if decrypted > 0 {
                sources.insert(DataSource::Chain);
            }
        }
        timings.decrypt_ms = elapsed_ms(phase);

        let phase = Instant::now();
        // After decryption so word counts see plaintext
        if options.include_analytics {
            self.attach_analytics(&mut results);
        }
        if !options.include_content {
            for result in &mut results {
                result.content = None;
            }
        }
        let quality = QualityMetrics::compute(&results, Utc::now());
        let suggestions = suggestions(&query, &plan, &results, &outcome.failed);
        let timeline = build_timeline(&results);
        timings.post_ms = elapsed_ms(phase);
        timings.total_ms = elapsed_ms(started);

        let context = RetrievalContext {
            success: true,
            query: query.query.clone(),
            stats: RetrievalStats {
                search_type: query.search_type,
                total_results: results.len(),
                timings,
                cache_hit_rate: self.query_cache.stats().hit_rate,
                data_sources: sources.into_iter().collect(),
                strategies_run: outcome.run,
                strategies_failed: outcome.failed,
                decrypted,
                quality,
            },
            results,
            suggestions,
            timeline,
        };

        info!(
            user_id = %query.user_id,
            search_type = query.search_type.as_str(),
            results = context.results.len(),
            total_ms = context.stats.timings.total_ms,
            "Search completed"
        );

        if options.use_cache {
            self.cache_context(key, &query.user_id, epoch, &context);
        }
        Ok(context)
    }

    /// Cache `context` unless the user's index changed since the search began
    ///
    /// `invalidate_user` bumps the epoch before purging, so the second check
    /// catches an invalidation that lands between the first check and the
    /// write.
    fn cache_context(&self, key: String, user_id: &str, epoch: u64, context: &RetrievalContext) {
        if self.epoch(user_id) != epoch {
            debug!(user_id, "Index changed during search, not caching");
            return;
        }
        self.query_cache.set(
            key.clone(),
            CachedContext {
                user_id: user_id.to_string(),
                context: context.clone(),
            },
        );
        if self.epoch(user_id) != epoch {
            self.query_cache.delete(&key);
        }
    }

    async fn dispatch(&self, plan: &SearchPlan, search_type: SearchType) -> Result<StrategyOutcome> {
        let single = |results: Vec<UnifiedMemoryResult>| StrategyOutcome {
            results,
            run: vec![search_type],
            failed: Vec::new(),
        };
        match search_type {
            SearchType::Vector => Ok(single(self.vector_search(plan).await?)),
            SearchType::Semantic => Ok(single(self.semantic_search(plan).await?)),
            SearchType::Graph => Ok(single(self.graph_search(plan).await?)),
            SearchType::Temporal => Ok(single(self.temporal_search(plan).await?)),
            SearchType::Keyword => Ok(single(self.keyword_search(plan).await?)),
            SearchType::Hybrid => self.hybrid_search(plan).await,
        }
    }

    /// Vector, semantic and graph concurrently, merged in that order; the
    /// temporal signal only re-scores what they found
    async fn hybrid_search(&self, plan: &SearchPlan) -> Result<StrategyOutcome> {
        // Warm the query embedding so vector and semantic share one call
        if let Err(e) = self.query_embedding(&plan.text).await {
            debug!(error = %e, "Query embedding failed before hybrid search");
        }

        let (vector, semantic, graph) = tokio::join!(
            self.vector_search(plan),
            self.semantic_search(plan),
            self.graph_search(plan),
        );

        let mut outcome = StrategyOutcome {
            results: Vec::new(),
            run: vec![SearchType::Vector, SearchType::Semantic, SearchType::Graph],
            failed: Vec::new(),
        };
        let mut first_error: Option<RecollectError> = None;
        for (strategy, result) in [
            (SearchType::Vector, vector),
            (SearchType::Semantic, semantic),
            (SearchType::Graph, graph),
        ] {
            match result {
                Ok(results) => merge_results(&mut outcome.results, results, true),
                Err(e) => {
                    warn!(strategy = strategy.as_str(), error = %e, "Search strategy failed");
                    outcome.failed.push(strategy);
                    first_error.get_or_insert(e);
                }
            }
        }
        if outcome.failed.len() == outcome.run.len() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        if plan.date_range.is_some() {
            outcome.run.push(SearchType::Temporal);
            match self.temporal_search(plan).await {
                Ok(results) => merge_results(&mut outcome.results, results, false),
                Err(e) => {
                    warn!(strategy = "temporal", error = %e, "Search strategy failed");
                    outcome.failed.push(SearchType::Temporal);
                }
            }
        }
        Ok(outcome)
    }

    /// Fill in plaintext for unencrypted results that arrived without it
    async fn load_content(&self, results: &mut [UnifiedMemoryResult], sources: &mut BTreeSet<DataSource>) {
        for result in results.iter_mut().filter(|r| !r.encrypted && r.content.is_none()) {
            if let Some(content) = self.content_cache.get(&result.id) {
                sources.insert(DataSource::Cache);
                result.content = Some(content);
                continue;
            }

            let record = match self.deps.ledger.get_memory(&result.id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(memory_id = %result.id, error = %e, "Could not load memory record");
                    None
                }
            };
            if result.blob_id.is_none() {
                result.blob_id = record.as_ref().and_then(|r| r.blob_id.clone());
            }
            let mut content = record.and_then(|r| r.content);
            if content.is_some() {
                sources.insert(DataSource::Chain);
            } else if let Some(blob_id) = &result.blob_id {
                match self.deps.blobs.retrieve(blob_id).await {
                    Ok(bytes) => {
                        sources.insert(DataSource::Storage);
                        content = Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    Err(e) => warn!(memory_id = %result.id, error = %e, "Could not load memory content"),
                }
            }

            if let Some(content) = content {
                self.content_cache.set_with_size(result.id.clone(), content.clone(), content.len());
                result.content = Some(content);
            }
        }
    }

    fn attach_analytics(&self, results: &mut [UnifiedMemoryResult]) {
        let now = Utc::now();
        for result in results.iter_mut() {
            let compute = || MemoryAnalytics {
                age_days: (now - result.created_at).num_seconds().max(0) as f64 / 86_400.0,
                word_count: result
                    .content
                    .as_deref()
                    .map(|c| c.split_whitespace().count())
                    .unwrap_or(0),
                tag_count: result.tags.len(),
                importance: result.importance,
            };
            // Without content the word count is unknown, so nothing is cached
            let analytics = if result.content.is_some() {
                self.analytics_cache.get_or_insert_with(result.id.clone(), compute)
            } else {
                compute()
            };
            result.analytics = Some(analytics);
        }
    }

    async fn attach_relationships(&self, results: &mut [UnifiedMemoryResult], user_id: &str) {
        for result in results.iter_mut() {
            match self.deps.graph.entities_for_memory(user_id, &result.id).await {
                Ok(entities) => result.relationships = Some(entities),
                Err(e) => warn!(memory_id = %result.id, error = %e, "Could not load relationships"),
            }
        }
    }

    /// Decrypt encrypted results in place; failures leave them encrypted
    async fn auto_decrypt(&self, results: &mut [UnifiedMemoryResult], user_id: &str) -> usize {
        let Some(decryption) = &self.deps.decryption else {
            return 0;
        };
        if !results.iter().any(|r| r.encrypted && r.content.is_none()) {
            return 0;
        }
        if !decryption.is_ready() {
            debug!("Decryption pipeline not ready, returning encrypted results");
            return 0;
        }
        match decryption.decrypt_memory_results(results, user_id).await {
            Ok(batch) => {
                if !batch.failed.is_empty() {
                    warn!(failed = batch.failed.len(), "Some results could not be decrypted");
                }
                batch.successful.len()
            }
            Err(e) => {
                warn!(error = %e, "Auto-decryption failed, returning encrypted results");
                0
            }
        }
    }
}

/// Category, importance, tag and content-type filters; the date range is
/// handled by the temporal strategy
fn apply_filters(results: &mut Vec<UnifiedMemoryResult>, filters: &QueryFilters) {
    results.retain(|r| {
        (filters.categories.is_empty() || filters.categories.contains(&r.category))
            && filters.importance.is_none_or(|range| range.contains(r.importance))
            && (filters.tags.is_empty() || r.tags.iter().any(|t| filters.tags.contains(t)))
            && (filters.content_types.is_empty() || filters.content_types.contains(&r.content_type))
    });
}

fn suggestions(
    query: &UnifiedMemoryQuery,
    plan: &SearchPlan,
    results: &[UnifiedMemoryResult],
    failed: &[SearchType],
) -> Vec<String> {
    let mut suggestions = Vec::new();
    if results.is_empty() {
        if query.search_type != SearchType::Hybrid {
            suggestions.push("Try a hybrid search to combine every strategy".to_string());
        }
        if query.similarity.threshold.is_some_and(|t| t > 0.0) {
            suggestions.push(format!("Lower the similarity threshold below {:.2}", plan.threshold));
        }
        let filters = &query.filters;
        if !filters.categories.is_empty() || !filters.tags.is_empty() || filters.importance.is_some() {
            suggestions.push("Remove category, tag or importance filters".to_string());
        }
    }
    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(|s| s.as_str()).collect();
        suggestions.push(format!("Retry later, unavailable strategies: {}", names.join(", ")));
    }
    if results.len() >= plan.k {
        suggestions.push("Add terms or filters to narrow the results".to_string());
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryKnowledgeGraph, InMemoryLedger, InMemoryVectorIndex, MemoryRecord};
    use crate::testing::{HashEmbedder, MemoryBlobStore};

    fn record(id: &str, content: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            owner: "u1".into(),
            category: "general".into(),
            importance: 5.0,
            tags: vec![],
            content_type: "text/plain".into(),
            created_at: Utc::now(),
            blob_id: None,
            content_hash: String::new(),
            encrypted: false,
            content: Some(content.into()),
        }
    }

    fn service(ledger: Arc<InMemoryLedger>) -> MemoryRetrievalService {
        MemoryRetrievalService::new(
            RetrievalConfig::default(),
            &IndexConfig::default(),
            RetrievalDeps {
                embedder: Arc::new(HashEmbedder::new()),
                index: Arc::new(InMemoryVectorIndex::default()),
                graph: Arc::new(InMemoryKnowledgeGraph::new()),
                ledger,
                blobs: Arc::new(MemoryBlobStore::new()),
                decryption: None,
            },
        )
    }

    #[test]
    fn test_filters() {
        let mut a = UnifiedMemoryResult::from_record(record("a", "x"), SearchType::Keyword, RelevanceBreakdown::default());
        a.tags = vec!["coffee".into()];
        let mut b = a.clone();
        b.id = "b".into();
        b.category = "work".into();
        b.tags = vec![];

        let mut results = vec![a.clone(), b.clone()];
        apply_filters(
            &mut results,
            &QueryFilters {
                tags: vec!["coffee".into(), "tea".into()],
                ..Default::default()
            },
        );
        assert_eq!(results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a"]);

        let mut results = vec![a, b];
        apply_filters(
            &mut results,
            &QueryFilters {
                categories: vec!["work".into()],
                importance: Some(ImportanceRange {
                    min: Some(6.0),
                    max: None,
                }),
                ..Default::default()
            },
        );
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_term_fraction() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.record_memory(&record("m1", "dark roast coffee")).await.unwrap();
        ledger.record_memory(&record("m2", "coffee only")).await.unwrap();
        ledger.record_memory(&record("m3", "nothing relevant")).await.unwrap();

        let context = service(ledger)
            .search_memories(UnifiedMemoryQuery::new("dark coffee", "u1").with_search_type(SearchType::Keyword))
            .await
            .unwrap();

        let ids: Vec<&str> = context.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!((context.results[0].relevance.keyword_match - 1.0).abs() < 1e-6);
        assert_eq!(context.stats.data_sources, vec![DataSource::Chain]);
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let err = service(Arc::new(InMemoryLedger::new()))
            .search_memories(UnifiedMemoryQuery::new("", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecollectError::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalidate_user_only_drops_that_user() {
        let ledger = Arc::new(InMemoryLedger::new());
        let service = service(ledger);
        for user in ["u1", "u2"] {
            service
                .search_memories(UnifiedMemoryQuery::new("anything", user).with_search_type(SearchType::Keyword))
                .await
                .unwrap();
        }
        assert_eq!(service.cache_stats().query.size, 2);
        assert_eq!(service.invalidate_user("u1"), 1);
        assert_eq!(service.cache_stats().query.size, 1);
    }

    #[test]
    fn test_suggestions_for_empty_results() {
        let query = UnifiedMemoryQuery::new("x", "u1")
            .with_search_type(SearchType::Vector)
            .with_threshold(0.9);
        let plan = SearchPlan {
            user_id: "u1".into(),
            text: "x".into(),
            terms: vec!["x".into()],
            k: 10,
            threshold: 0.9,
            ef_search: 100,
            date_range: None,
        };
        let suggestions = suggestions(&query, &plan, &[], &[SearchType::Graph]);
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions[1].contains("0.90"));
        assert!(suggestions[2].contains("graph"));
    }

    /// Graph whose searches wait until the test releases them
    #[derive(Default)]
    struct GatedGraph {
        inner: InMemoryKnowledgeGraph,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl KnowledgeGraph for GatedGraph {
        async fn search_graph(&self, text: &str, max_results: usize) -> Result<Vec<crate::collab::GraphEntity>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.search_graph(text, max_results).await
        }

        async fn find_memories_related_to_entity(&self, label: &str, user_id: &str) -> Result<Vec<String>> {
            self.inner.find_memories_related_to_entity(label, user_id).await
        }

        async fn link_entities(&self, user_id: &str, memory_id: &str, entities: &[String]) -> Result<()> {
            self.inner.link_entities(user_id, memory_id, entities).await
        }

        async fn entities_for_memory(&self, user_id: &str, memory_id: &str) -> Result<Vec<String>> {
            self.inner.entities_for_memory(user_id, memory_id).await
        }
    }

    #[tokio::test]
    async fn test_search_spanning_an_invalidation_is_not_cached() {
        let embedder = Arc::new(HashEmbedder::new());
        let index = Arc::new(InMemoryVectorIndex::default());
        let graph = Arc::new(GatedGraph::default());
        let service = MemoryRetrievalService::new(
            RetrievalConfig::default(),
            &IndexConfig::default(),
            RetrievalDeps {
                embedder: embedder.clone(),
                index: index.clone(),
                graph: graph.clone(),
                ledger: Arc::new(InMemoryLedger::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                decryption: None,
            },
        );
        let query = UnifiedMemoryQuery::new("dark roast coffee", "u1");

        let running = tokio::spawn({
            let service = service.clone();
            let query = query.clone();
            async move { service.search_memories(query).await }
        });
        graph.entered.notified().await;

        // The memory becomes searchable while the first search is still running
        index
            .add_vector_batched("u1", "m1", embedder.vector_for("dark roast coffee"), record("m1", "dark roast coffee"))
            .await
            .unwrap();
        index.force_flush("test").await.unwrap();
        service.on_indexed("u1", &["m1".to_string()]);

        graph.release.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(service.cache_stats().query.size, 0);

        graph.release.notify_one();
        let after = service.search_memories(query).await.unwrap();
        assert_eq!(after.results.len(), 1);
        assert_eq!(after.results[0].id, "m1");
        assert_eq!(service.cache_stats().query.hits, 0);
    }
}
