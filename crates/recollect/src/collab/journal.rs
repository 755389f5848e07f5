//! Ledger and graph state that survives a restart
//!
//! Both keep their working set in the in-memory implementations and append
//! every mutation as one JSON line to a file under the data directory. On
//! open the file is replayed into a fresh in-memory instance.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collab::{
    GraphEntity, InMemoryKnowledgeGraph, InMemoryLedger, KnowledgeGraph, MemoryLedger, MemoryRecord,
};
use crate::error::{RecollectError, Result};

/// Append-only JSON-lines file
struct Journal {
    path: PathBuf,
    // Serializes appends so lines never interleave
    file: Mutex<tokio::fs::File>,
}

impl Journal {
    /// Open `path` for appending and return the events already in it
    ///
    /// A line that does not parse (a torn final write) is skipped.
    async fn open<E: DeserializeOwned>(path: &Path) -> Result<(Self, Vec<E>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RecollectError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let events = match tokio::fs::read_to_string(path).await {
            Ok(text) => text
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .filter_map(|(n, line)| match serde_json::from_str(line) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(path = %path.display(), line = n + 1, error = %e, "Skipping unreadable journal line");
                        None
                    }
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(RecollectError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| RecollectError::Storage(format!("Failed to open {}: {e}", path.display())))?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
            events,
        ))
    }

    async fn append<E: Serialize>(&self, event: &E) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;
        written.map_err(|e| RecollectError::Storage(format!("Failed to append to {}: {e}", self.path.display())))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LedgerEvent {
    Record {
        record: MemoryRecord,
    },
    Grant {
        owner: String,
        memory_id: String,
        grantee: String,
    },
}

/// Ownership ledger journaled to a file
pub struct FsLedger {
    inner: InMemoryLedger,
    journal: Journal,
}

impl FsLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, events) = Journal::open::<LedgerEvent>(path.as_ref()).await?;
        let inner = InMemoryLedger::new();
        let replayed = events.len();
        for event in events {
            match event {
                LedgerEvent::Record { record } => {
                    inner.record_memory(&record).await?;
                }
                LedgerEvent::Grant {
                    owner,
                    memory_id,
                    grantee,
                } => {
                    if let Err(e) = inner.grant_access(&owner, &memory_id, &grantee).await {
                        warn!(memory_id = %memory_id, error = %e, "Dropping grant that no longer applies");
                    }
                }
            }
        }
        info!(path = %path.as_ref().display(), events = replayed, memories = inner.len(), "Opened ledger");
        Ok(Self { inner, journal })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl MemoryLedger for FsLedger {
    async fn record_memory(&self, record: &MemoryRecord) -> Result<String> {
        self.journal
            .append(&LedgerEvent::Record {
                record: record.clone(),
            })
            .await?;
        self.inner.record_memory(record).await
    }

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.inner.get_memory(id).await
    }

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        self.inner.list_user_memories(user_id).await
    }

    async fn can_access(&self, user_id: &str, memory_id: &str) -> Result<bool> {
        self.inner.can_access(user_id, memory_id).await
    }

    async fn grant_access(&self, owner: &str, memory_id: &str, grantee: &str) -> Result<()> {
        // Refused grants never reach the journal
        self.inner.grant_access(owner, memory_id, grantee).await?;
        self.journal
            .append(&LedgerEvent::Grant {
                owner: owner.to_string(),
                memory_id: memory_id.to_string(),
                grantee: grantee.to_string(),
            })
            .await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkEvent {
    user_id: String,
    memory_id: String,
    entities: Vec<String>,
}

/// Entity graph journaled to a file
pub struct FsKnowledgeGraph {
    inner: InMemoryKnowledgeGraph,
    journal: Journal,
}

impl FsKnowledgeGraph {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (journal, events) = Journal::open::<LinkEvent>(path.as_ref()).await?;
        let inner = InMemoryKnowledgeGraph::new();
        for event in &events {
            inner
                .link_entities(&event.user_id, &event.memory_id, &event.entities)
                .await?;
        }
        info!(
            path = %path.as_ref().display(),
            events = events.len(),
            entities = inner.entity_count(),
            "Opened knowledge graph"
        );
        Ok(Self { inner, journal })
    }

    pub fn entity_count(&self) -> usize {
        self.inner.entity_count()
    }
}

#[async_trait]
impl KnowledgeGraph for FsKnowledgeGraph {
    async fn search_graph(&self, text: &str, max_results: usize) -> Result<Vec<GraphEntity>> {
        self.inner.search_graph(text, max_results).await
    }

    async fn find_memories_related_to_entity(&self, label: &str, user_id: &str) -> Result<Vec<String>> {
        self.inner.find_memories_related_to_entity(label, user_id).await
    }

    async fn link_entities(&self, user_id: &str, memory_id: &str, entities: &[String]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.journal
            .append(&LinkEvent {
                user_id: user_id.to_string(),
                memory_id: memory_id.to_string(),
                entities: entities.to_vec(),
            })
            .await?;
        debug!(memory_id, count = entities.len(), "Journaled entity links");
        self.inner.link_entities(user_id, memory_id, entities).await
    }

    async fn entities_for_memory(&self, user_id: &str, memory_id: &str) -> Result<Vec<String>> {
        self.inner.entities_for_memory(user_id, memory_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, owner: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            category: "fact".to_string(),
            importance: 5.0,
            tags: vec!["travel".to_string()],
            content_type: "text/plain".to_string(),
            created_at: Utc::now(),
            blob_id: Some("ab12".to_string()),
            content_hash: "ff".to_string(),
            encrypted: true,
            content: None,
        }
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let memory = record("m1", "alice");
        let ledger = FsLedger::open(&path).await.unwrap();
        ledger.record_memory(&memory).await.unwrap();
        ledger.grant_access("alice", "m1", "bob").await.unwrap();
        assert!(ledger.grant_access("mallory", "m1", "mallory").await.is_err());
        drop(ledger);

        let reopened = FsLedger::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get_memory("m1").await.unwrap(), Some(memory));
        assert!(reopened.can_access("alice", "m1").await.unwrap());
        assert!(reopened.can_access("bob", "m1").await.unwrap());
        assert!(!reopened.can_access("mallory", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let ledger = FsLedger::open(&path).await.unwrap();
        ledger.record_memory(&record("m1", "alice")).await.unwrap();
        drop(ledger);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"op\":\"record\",\"rec");
        std::fs::write(&path, text).unwrap();

        let reopened = FsLedger::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.can_access("alice", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_graph_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.jsonl");

        let graph = FsKnowledgeGraph::open(&path).await.unwrap();
        graph
            .link_entities("u1", "m1", &["Espresso Machine".to_string()])
            .await
            .unwrap();
        graph.link_entities("u1", "m2", &[]).await.unwrap();
        drop(graph);

        let reopened = FsKnowledgeGraph::open(&path).await.unwrap();
        assert_eq!(reopened.entity_count(), 1);
        assert_eq!(
            reopened.find_memories_related_to_entity("espresso machine", "u1").await.unwrap(),
            vec!["m1".to_string()]
        );
        assert_eq!(
            reopened.entities_for_memory("u1", "m1").await.unwrap(),
            vec!["Espresso Machine".to_string()]
        );
        let hits = reopened.search_graph("espresso", 5).await.unwrap();
        assert_eq!(hits[0].label, "Espresso Machine");
    }
}
