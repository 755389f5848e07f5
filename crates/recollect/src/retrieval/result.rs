use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::query::SearchType;
use crate::collab::MemoryRecord;

pub const VECTOR_WEIGHT: f32 = 0.40;
pub const SEMANTIC_WEIGHT: f32 = 0.30;
pub const KEYWORD_WEIGHT: f32 = 0.10;
pub const GRAPH_WEIGHT: f32 = 0.15;
pub const TEMPORAL_WEIGHT: f32 = 0.05;

/// Per-signal relevance; a signal no strategy computed stays 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceBreakdown {
    pub vector_similarity: f32,
    pub semantic_match: f32,
    pub keyword_match: f32,
    pub graph_relevance: f32,
    pub temporal_relevance: f32,
}

impl RelevanceBreakdown {
    /// Weighted sum that ranks results
    pub fn fused(&self) -> f32 {
        VECTOR_WEIGHT * self.vector_similarity
            + SEMANTIC_WEIGHT * self.semantic_match
            + KEYWORD_WEIGHT * self.keyword_match
            + GRAPH_WEIGHT * self.graph_relevance
            + TEMPORAL_WEIGHT * self.temporal_relevance
    }

    /// Take every signal `other` computed, keeping ours where it has none
    pub fn absorb(&mut self, other: &RelevanceBreakdown) {
        self.vector_similarity = self.vector_similarity.max(other.vector_similarity);
        self.semantic_match = self.semantic_match.max(other.semantic_match);
        self.keyword_match = self.keyword_match.max(other.keyword_match);
        self.graph_relevance = self.graph_relevance.max(other.graph_relevance);
        self.temporal_relevance = self.temporal_relevance.max(other.temporal_relevance);
    }
}

/// Cached per-memory figures attached when analytics are requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAnalytics {
    pub age_days: f64,
    pub word_count: usize,
    pub tag_count: usize,
    pub importance: f32,
}

/// One ranked memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMemoryResult {
    pub id: String,
    pub owner: String,
    pub category: String,
    pub importance: f32,
    pub tags: Vec<String>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Plaintext, absent until loaded or decrypted
    pub content: Option<String>,
    pub encrypted: bool,
    pub decrypted: bool,
    pub content_hash: String,
    pub blob_id: Option<String>,
    pub relevance: RelevanceBreakdown,
    pub relevance_score: f32,
    /// Strategies that found this memory, in merge order
    pub sources: Vec<SearchType>,
    #[serde(default)]
    pub analytics: Option<MemoryAnalytics>,
    /// Entity labels linked to the memory
    #[serde(default)]
    pub relationships: Option<Vec<String>>,
}

impl UnifiedMemoryResult {
    pub fn from_record(record: MemoryRecord, source: SearchType, relevance: RelevanceBreakdown) -> Self {
        Self {
            id: record.id,
            owner: record.owner,
            category: record.category,
            importance: record.importance,
            tags: record.tags,
            content_type: record.content_type,
            created_at: record.created_at,
            content: record.content,
            encrypted: record.encrypted,
            decrypted: false,
            content_hash: record.content_hash,
            blob_id: record.blob_id,
            relevance_score: relevance.fused(),
            relevance,
            sources: vec![source],
            analytics: None,
            relationships: None,
        }
    }

    /// Fold a later strategy's hit for the same memory into this one
    pub fn merge(&mut self, other: &UnifiedMemoryResult) {
        self.relevance.absorb(&other.relevance);
        for source in &other.sources {
            if !self.sources.contains(source) {
                self.sources.push(*source);
            }
        }
        if self.blob_id.is_none() {
            self.blob_id.clone_from(&other.blob_id);
        }
        self.rescore();
    }

    pub fn rescore(&mut self) {
        self.relevance_score = self.relevance.fused();
    }
}

/// Merge strategy outputs by id; the first writer keeps the base record
pub(crate) fn merge_results(
    merged: &mut Vec<UnifiedMemoryResult>,
    incoming: Vec<UnifiedMemoryResult>,
    insert_new: bool,
) {
    for result in incoming {
        match merged.iter_mut().find(|r| r.id == result.id) {
            Some(existing) => existing.merge(&result),
            None if insert_new => merged.push(result),
            None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Storage,
    Chain,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub search_ms: u64,
    pub filter_ms: u64,
    pub enrich_ms: u64,
    pub rank_ms: u64,
    pub decrypt_ms: u64,
    pub post_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub average_relevance: f32,
    /// Distinct categories divided by result count
    pub category_diversity: f32,
    /// 1 - average age as a fraction of a year, floored at 0
    pub freshness: f32,
}

impl QualityMetrics {
    pub fn compute(results: &[UnifiedMemoryResult], now: DateTime<Utc>) -> Self {
        if results.is_empty() {
            return Self::default();
        }
        let count = results.len() as f32;
        let average_relevance = results.iter().map(|r| r.relevance_score).sum::<f32>() / count;
        let categories: HashSet<&str> = results.iter().map(|r| r.category.as_str()).collect();
        let average_age_days = results
            .iter()
            .map(|r| (now - r.created_at).num_seconds().max(0) as f64 / 86_400.0)
            .sum::<f64>()
            / results.len() as f64;
        Self {
            average_relevance,
            category_diversity: categories.len() as f32 / count,
            freshness: (1.0 - (average_age_days / 365.0).min(1.0)) as f32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub search_type: SearchType,
    pub total_results: usize,
    pub timings: PhaseTimings,
    /// hits / (hits + misses) of the query cache
    pub cache_hit_rate: f64,
    pub data_sources: Vec<DataSource>,
    pub strategies_run: Vec<SearchType>,
    pub strategies_failed: Vec<SearchType>,
    pub decrypted: usize,
    pub quality: QualityMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// `YYYY-MM-DD`
    pub date: String,
    pub count: usize,
    pub memory_ids: Vec<String>,
}

/// Results grouped per day, oldest first
pub fn build_timeline(results: &[UnifiedMemoryResult]) -> Vec<TimelineEntry> {
    let mut days: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for result in results {
        days.entry(result.created_at.format("%Y-%m-%d").to_string())
            .or_default()
            .push(result.id.clone());
    }
    days.into_iter()
        .map(|(date, memory_ids)| TimelineEntry {
            date,
            count: memory_ids.len(),
            memory_ids,
        })
        .collect()
}

/// Everything `search_memories` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalContext {
    pub success: bool,
    pub query: String,
    pub results: Vec<UnifiedMemoryResult>,
    pub stats: RetrievalStats,
    pub suggestions: Vec<String>,
    pub timeline: Vec<TimelineEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn result(id: &str, category: &str, relevance: RelevanceBreakdown) -> UnifiedMemoryResult {
        UnifiedMemoryResult::from_record(
            MemoryRecord {
                id: id.into(),
                owner: "u1".into(),
                category: category.into(),
                importance: 5.0,
                tags: vec![],
                content_type: "text/plain".into(),
                created_at: Utc::now(),
                blob_id: None,
                content_hash: String::new(),
                encrypted: false,
                content: None,
            },
            SearchType::Vector,
            relevance,
        )
    }

    #[test]
    fn test_fusion_weights() {
        let breakdown = RelevanceBreakdown {
            vector_similarity: 0.8,
            semantic_match: 0.6,
            ..Default::default()
        };
        assert!((breakdown.fused() - 0.50).abs() < 1e-6);

        let graph_only = RelevanceBreakdown {
            graph_relevance: 1.0,
            ..Default::default()
        };
        assert!((graph_only.fused() - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_merge_keeps_first_base_and_adds_scores() {
        let mut merged = vec![result(
            "m1",
            "work",
            RelevanceBreakdown {
                vector_similarity: 0.8,
                ..Default::default()
            },
        )];
        let mut graph_hit = result(
            "m1",
            "other",
            RelevanceBreakdown {
                graph_relevance: 0.5,
                ..Default::default()
            },
        );
        graph_hit.sources = vec![SearchType::Graph];
        merge_results(&mut merged, vec![graph_hit], true);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].category, "work");
        assert_eq!(merged[0].sources, vec![SearchType::Vector, SearchType::Graph]);
        assert!((merged[0].relevance_score - (0.4 * 0.8 + 0.15 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_merge_without_insert_only_updates() {
        let mut merged = vec![result("m1", "work", RelevanceBreakdown::default())];
        merge_results(
            &mut merged,
            vec![result("m2", "work", RelevanceBreakdown::default())],
            false,
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_quality_metrics() {
        let now = Utc::now();
        let mut a = result("a", "work", RelevanceBreakdown { vector_similarity: 1.0, ..Default::default() });
        let mut b = result("b", "home", RelevanceBreakdown::default());
        a.created_at = now;
        b.created_at = now - Duration::days(730);

        let quality = QualityMetrics::compute(&[a, b], now);
        assert!((quality.average_relevance - 0.2).abs() < 1e-6);
        assert_eq!(quality.category_diversity, 1.0);
        assert_eq!(quality.freshness, 0.0);
        assert_eq!(QualityMetrics::compute(&[], now), QualityMetrics::default());
    }

    #[test]
    fn test_timeline_groups_by_day() {
        let mut a = result("a", "x", RelevanceBreakdown::default());
        let mut b = result("b", "x", RelevanceBreakdown::default());
        let c = result("c", "x", RelevanceBreakdown::default());
        a.created_at = c.created_at - Duration::days(2);
        b.created_at = c.created_at - Duration::days(2);

        let timeline = build_timeline(&[c, a, b]);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].memory_ids, vec!["a", "b"]);
        assert_eq!(timeline[1].count, 1);
    }
}
