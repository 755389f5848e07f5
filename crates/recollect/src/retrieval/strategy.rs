//! The individual search strategies

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::RetrievalInner;
use super::query::{DateRange, SearchType, query_terms};
use super::result::{RelevanceBreakdown, UnifiedMemoryResult};
use crate::collab::{MemoryRecord, SearchParams, VectorHit};
use crate::error::Result;
use crate::retry::retry_with_backoff;

/// Weight of vector similarity inside the semantic score; the rest is term
/// overlap
const SEMANTIC_SIMILARITY_SHARE: f32 = 0.7;

/// A validated query resolved against configured defaults
#[derive(Debug, Clone)]
pub(crate) struct SearchPlan {
    pub user_id: String,
    pub text: String,
    pub terms: Vec<String>,
    pub k: usize,
    pub threshold: f32,
    pub ef_search: usize,
    pub date_range: Option<DateRange>,
}

impl SearchPlan {
    /// Candidates fetched from the index before filtering and truncation
    fn fetch_k(&self) -> usize {
        self.k.saturating_mul(2)
    }
}

/// Fraction of `terms` that occur in `haystack`, case-insensitively
fn term_fraction(terms: &[String], haystack: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = haystack.to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f32 / terms.len() as f32
}

/// Text a record can be matched against without decrypting it
fn searchable_text(record: &MemoryRecord) -> String {
    let mut text = record.content.clone().unwrap_or_default();
    text.push(' ');
    text.push_str(&record.category);
    for tag in &record.tags {
        text.push(' ');
        text.push_str(tag);
    }
    text
}

impl RetrievalInner {
    /// Embed query text once per distinct text while it stays in the LRU
    pub(super) async fn query_embedding(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let cached = self.embedding_lru().get(text).cloned();
        if let Some(vector) = cached {
            return Ok(vector);
        }
        let embedder = &self.deps.embedder;
        let vector = Arc::new(
            retry_with_backoff(&self.retry, "query embedding", || embedder.embed_text(text)).await?,
        );
        self.embedding_lru().put(text.to_string(), Arc::clone(&vector));
        Ok(vector)
    }

    /// Nearest neighbours with their similarity, at or above the threshold
    async fn similar(&self, plan: &SearchPlan) -> Result<Vec<(VectorHit, f32)>> {
        let vector = self.query_embedding(&plan.text).await?;
        let params = SearchParams {
            k: plan.fetch_k(),
            ef_search: plan.ef_search,
            threshold: Some(plan.threshold),
        };
        let hits = self
            .deps
            .index
            .search_similar(&plan.user_id, &vector, &params)
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let similarity = (1.0 - hit.distance).clamp(0.0, 1.0);
                (hit, similarity)
            })
            .filter(|(_, similarity)| *similarity >= plan.threshold)
            .collect())
    }

    pub(super) async fn vector_search(&self, plan: &SearchPlan) -> Result<Vec<UnifiedMemoryResult>> {
        let hits = self.similar(plan).await?;
        debug!(hits = hits.len(), "Vector strategy finished");
        Ok(hits
            .into_iter()
            .map(|(hit, similarity)| {
                UnifiedMemoryResult::from_record(
                    hit.record,
                    SearchType::Vector,
                    RelevanceBreakdown {
                        vector_similarity: similarity,
                        ..Default::default()
                    },
                )
            })
            .collect())
    }

    /// Vector hits re-scored by how many query terms they contain
    pub(super) async fn semantic_search(&self, plan: &SearchPlan) -> Result<Vec<UnifiedMemoryResult>> {
        let hits = self.similar(plan).await?;
        Ok(hits
            .into_iter()
            .map(|(hit, similarity)| {
                let overlap = term_fraction(&plan.terms, &searchable_text(&hit.record));
                let semantic_match = SEMANTIC_SIMILARITY_SHARE * similarity
                    + (1.0 - SEMANTIC_SIMILARITY_SHARE) * overlap;
                UnifiedMemoryResult::from_record(
                    hit.record,
                    SearchType::Semantic,
                    RelevanceBreakdown {
                        semantic_match,
                        ..Default::default()
                    },
                )
            })
            .collect())
    }

    /// Memories linked to entities that match the query text
    pub(super) async fn graph_search(&self, plan: &SearchPlan) -> Result<Vec<UnifiedMemoryResult>> {
        let graph = &self.deps.graph;
        let entities = graph
            .search_graph(&plan.text, self.config.graph_max_results)
            .await?;

        // Discovery order, best entity score per memory
        let mut scored: Vec<(String, f32)> = Vec::new();
        for entity in &entities {
            for id in graph
                .find_memories_related_to_entity(&entity.label, &plan.user_id)
                .await?
            {
                match scored.iter_mut().find(|(seen, _)| *seen == id) {
                    Some((_, score)) => *score = score.max(entity.score),
                    None => scored.push((id, entity.score)),
                }
            }
        }

        let mut results = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            let Some(record) = self.resolve_record(&plan.user_id, &id).await? else {
                debug!(memory_id = %id, "Graph hit has no stored record");
                continue;
            };
            results.push(UnifiedMemoryResult::from_record(
                record,
                SearchType::Graph,
                RelevanceBreakdown {
                    graph_relevance: score.clamp(0.0, 1.0),
                    ..Default::default()
                },
            ));
        }
        debug!(entities = entities.len(), hits = results.len(), "Graph strategy finished");
        Ok(results)
    }

    /// Index entry first, then the ledger for memories not yet indexed here
    async fn resolve_record(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>> {
        if let Some(record) = self.deps.index.get(user_id, id).await? {
            return Ok(Some(record));
        }
        Ok(self
            .deps
            .ledger
            .get_memory(id)
            .await?
            .filter(|record| record.owner == user_id))
    }

    /// All of the user's memories inside the date range, later ones scoring
    /// higher
    pub(super) async fn temporal_search(&self, plan: &SearchPlan) -> Result<Vec<UnifiedMemoryResult>> {
        let range = plan.date_range.unwrap_or_default();
        let records: Vec<MemoryRecord> = self
            .deps
            .ledger
            .list_user_memories(&plan.user_id)
            .await?
            .into_iter()
            .filter(|r| range.contains(r.created_at))
            .collect();
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let bound = |pick: fn(&MemoryRecord, &MemoryRecord) -> bool| {
            records
                .iter()
                .reduce(|a, b| if pick(a, b) { a } else { b })
                .map(|r| r.created_at)
        };
        let start: Option<DateTime<Utc>> =
            range.start.or_else(|| bound(|a, b| a.created_at <= b.created_at));
        let end: Option<DateTime<Utc>> =
            range.end.or_else(|| bound(|a, b| a.created_at >= b.created_at));

        Ok(records
            .into_iter()
            .map(|record| {
                let temporal_relevance = match (start, end) {
                    (Some(start), Some(end)) if end > start => {
                        let span = (end - start).num_milliseconds() as f64;
                        let offset = (record.created_at - start).num_milliseconds() as f64;
                        (offset / span).clamp(0.0, 1.0) as f32
                    }
                    _ => 1.0,
                };
                UnifiedMemoryResult::from_record(
                    record,
                    SearchType::Temporal,
                    RelevanceBreakdown {
                        temporal_relevance,
                        ..Default::default()
                    },
                )
            })
            .collect())
    }

    /// Case-insensitive substring match over unencrypted content
    pub(super) async fn keyword_search(&self, plan: &SearchPlan) -> Result<Vec<UnifiedMemoryResult>> {
        let terms = query_terms(&plan.text);
        let records = self.deps.ledger.list_user_memories(&plan.user_id).await?;
        Ok(records
            .into_iter()
            .filter(|record| !record.encrypted)
            .filter_map(|record| {
                let keyword_match = term_fraction(&terms, record.content.as_deref()?);
                (keyword_match > 0.0).then(|| {
                    UnifiedMemoryResult::from_record(
                        record,
                        SearchType::Keyword,
                        RelevanceBreakdown {
                            keyword_match,
                            ..Default::default()
                        },
                    )
                })
            })
            .collect())
    }
}
