use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::content_hash;
use crate::error::{RecollectError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Vector,
    Semantic,
    Graph,
    Temporal,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Vector => "vector",
            SearchType::Semantic => "semantic",
            SearchType::Graph => "graph",
            SearchType::Temporal => "temporal",
            SearchType::Keyword => "keyword",
            SearchType::Hybrid => "hybrid",
        }
    }
}

/// Inclusive date window; a missing bound is open
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at <= end)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportanceRange {
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
}

impl ImportanceRange {
    pub fn contains(&self, importance: f32) -> bool {
        self.min.is_none_or(|min| importance >= min) && self.max.is_none_or(|max| importance <= max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub categories: Vec<String>,
    /// Drives the temporal strategy
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub importance: Option<ImportanceRange>,
    /// A result matches when it carries any of these tags
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityParams {
    /// Maximum results returned
    #[serde(default)]
    pub k: Option<usize>,
    /// Minimum vector similarity (0.0-1.0)
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub ef_search: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Return plaintext; without it results carry metadata and scores only
    #[serde(default = "default_true")]
    pub include_content: bool,
    #[serde(default)]
    pub include_analytics: bool,
    #[serde(default)]
    pub include_relationships: bool,
    /// Decrypt encrypted results when the decryption pipeline is ready
    #[serde(default = "default_true")]
    pub auto_decrypt: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            include_content: true,
            include_analytics: false,
            include_relationships: false,
            auto_decrypt: true,
        }
    }
}

/// A search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMemoryQuery {
    #[serde(default)]
    pub query: String,
    pub user_id: String,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default)]
    pub similarity: SimilarityParams,
    #[serde(default)]
    pub options: QueryOptions,
}

impl UnifiedMemoryQuery {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            search_type: SearchType::default(),
            filters: QueryFilters::default(),
            similarity: SimilarityParams::default(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.similarity.k = Some(k);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity.threshold = Some(threshold);
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.filters.date_range = Some(range);
        self
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.options.use_cache = false;
        self
    }

    /// Rejects queries that cannot be answered before any collaborator call
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(RecollectError::Validation("user_id is required".into()));
        }
        if self.query.trim().is_empty() && self.search_type != SearchType::Temporal {
            return Err(RecollectError::Validation(format!(
                "{} search requires query text",
                self.search_type.as_str()
            )));
        }
        if self.similarity.k == Some(0) {
            return Err(RecollectError::Validation("k must be at least 1".into()));
        }
        if let Some(threshold) = self.similarity.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RecollectError::Validation(format!(
                    "threshold must be within 0-1, got {threshold}"
                )));
            }
        }
        if let Some(range) = &self.filters.date_range {
            if let (Some(start), Some(end)) = (range.start, range.end) {
                if start > end {
                    return Err(RecollectError::Validation(
                        "date range starts after it ends".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stable hash of the whole query
    pub fn cache_key(&self) -> Result<String> {
        Ok(content_hash(&serde_json::to_vec(self)?))
    }

    pub(crate) fn terms(&self) -> Vec<String> {
        query_terms(&self.query)
    }
}

/// Lowercase, de-duplicated words of `text`
pub(crate) fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}
