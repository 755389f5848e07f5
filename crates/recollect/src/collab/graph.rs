use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::collab::{GraphEntity, KnowledgeGraph};
use crate::error::Result;

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn normalize(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Entity graph held in memory
///
/// Labels are matched case-insensitively. An entity's score for a search is
/// the fraction of its label tokens that appear in the search text.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeGraph {
    // normalized label -> display label
    labels: DashMap<String, String>,
    // (normalized label, user) -> memory ids
    mentions: DashMap<(String, String), BTreeSet<String>>,
    // (user, memory id) -> labels
    by_memory: DashMap<(String, String), Vec<String>>,
    search_calls: AtomicUsize,
}

impl InMemoryKnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn entity_count(&self) -> usize {
        self.labels.len()
    }
}

#[async_trait]
impl KnowledgeGraph for InMemoryKnowledgeGraph {
    async fn search_graph(&self, text: &str, max_results: usize) -> Result<Vec<GraphEntity>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let query = tokens(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: HashMap<String, f32> = HashMap::new();
        for entry in self.labels.iter() {
            let label_tokens = tokens(entry.key());
            if label_tokens.is_empty() {
                continue;
            }
            let matched = label_tokens.intersection(&query).count();
            if matched > 0 {
                scored.insert(
                    entry.value().clone(),
                    matched as f32 / label_tokens.len() as f32,
                );
            }
        }

        let mut entities: Vec<GraphEntity> = scored
            .into_iter()
            .map(|(label, score)| GraphEntity { label, score })
            .collect();
        entities.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.label.cmp(&b.label)));
        entities.truncate(max_results);
        Ok(entities)
    }

    async fn find_memories_related_to_entity(
        &self,
        label: &str,
        user_id: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .mentions
            .get(&(normalize(label), user_id.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn link_entities(
        &self,
        user_id: &str,
        memory_id: &str,
        entities: &[String],
    ) -> Result<()> {
        let mut linked = Vec::new();
        for label in entities {
            let key = normalize(label);
            if key.is_empty() {
                continue;
            }
            self.labels.entry(key.clone()).or_insert_with(|| label.trim().to_string());
            self.mentions
                .entry((key, user_id.to_string()))
                .or_default()
                .insert(memory_id.to_string());
            linked.push(label.trim().to_string());
        }
        if !linked.is_empty() {
            self.by_memory
                .entry((user_id.to_string(), memory_id.to_string()))
                .or_default()
                .extend(linked);
        }
        Ok(())
    }

    async fn entities_for_memory(&self, user_id: &str, memory_id: &str) -> Result<Vec<String>> {
        Ok(self
            .by_memory
            .get(&(user_id.to_string(), memory_id.to_string()))
            .map(|labels| labels.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_score_is_token_fraction() {
        let graph = InMemoryKnowledgeGraph::new();
        graph
            .link_entities("u1", "m1", &["Project Falcon".to_string()])
            .await
            .unwrap();

        let entities = graph.search_graph("status of falcon", 10).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].label, "Project Falcon");
        assert!((entities[0].score - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_memories_are_scoped_by_user() {
        let graph = InMemoryKnowledgeGraph::new();
        graph.link_entities("u1", "m1", &["Alice".to_string()]).await.unwrap();
        graph.link_entities("u2", "m2", &["alice".to_string()]).await.unwrap();

        assert_eq!(
            graph.find_memories_related_to_entity("ALICE", "u1").await.unwrap(),
            vec!["m1".to_string()]
        );
        assert_eq!(graph.entity_count(), 1);
        assert_eq!(
            graph.entities_for_memory("u2", "m2").await.unwrap(),
            vec!["alice".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_match_returns_empty() {
        let graph = InMemoryKnowledgeGraph::new();
        graph.link_entities("u1", "m1", &["Berlin".to_string()]).await.unwrap();
        assert!(graph.search_graph("paris weather", 5).await.unwrap().is_empty());
    }
}
