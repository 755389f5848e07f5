use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::collab::{MemoryLedger, MemoryRecord, content_hash};
use crate::error::{RecollectError, Result};

/// Ownership ledger held in memory
///
/// Transaction digests are the SHA-256 of the serialized record.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: DashMap<String, MemoryRecord>,
    // memory id -> addresses granted access besides the owner
    grants: DashMap<String, HashSet<String>>,
    list_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MemoryLedger for InMemoryLedger {
    async fn record_memory(&self, record: &MemoryRecord) -> Result<String> {
        let digest = content_hash(serde_json::to_string(record)?.as_bytes());
        self.records.insert(record.id.clone(), record.clone());
        debug!(memory_id = %record.id, digest = %digest, "Recorded memory on ledger");
        Ok(digest)
    }

    async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| r.owner == user_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn can_access(&self, user_id: &str, memory_id: &str) -> Result<bool> {
        let Some(record) = self.records.get(memory_id) else {
            return Ok(false);
        };
        if record.owner == user_id {
            return Ok(true);
        }
        Ok(self
            .grants
            .get(memory_id)
            .is_some_and(|grantees| grantees.contains(user_id)))
    }

    async fn grant_access(&self, owner: &str, memory_id: &str, grantee: &str) -> Result<()> {
        let record = self
            .records
            .get(memory_id)
            .ok_or_else(|| RecollectError::NotFound(format!("memory {memory_id}")))?;
        if record.owner != owner {
            warn!(memory_id, requester = owner, "Grant refused: requester is not the owner");
            return Err(RecollectError::AccessDenied(format!(
                "{owner} does not own {memory_id}"
            )));
        }
        drop(record);
        self.grants
            .entry(memory_id.to_string())
            .or_default()
            .insert(grantee.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(id: &str, owner: &str, age_days: i64) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            category: "fact".to_string(),
            importance: 1.0,
            tags: vec![],
            content_type: "text/plain".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
            blob_id: None,
            content_hash: String::new(),
            encrypted: false,
            content: Some("x".to_string()),
        }
    }

    #[tokio::test]
    async fn test_owner_and_grantee_access() {
        let ledger = InMemoryLedger::new();
        ledger.record_memory(&record("m1", "alice", 0)).await.unwrap();

        assert!(ledger.can_access("alice", "m1").await.unwrap());
        assert!(!ledger.can_access("bob", "m1").await.unwrap());

        ledger.grant_access("alice", "m1", "bob").await.unwrap();
        assert!(ledger.can_access("bob", "m1").await.unwrap());

        assert!(!ledger.can_access("alice", "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_only_owner_can_grant() {
        let ledger = InMemoryLedger::new();
        ledger.record_memory(&record("m1", "alice", 0)).await.unwrap();
        assert!(matches!(
            ledger.grant_access("mallory", "m1", "mallory").await,
            Err(RecollectError::AccessDenied(_))
        ));
        assert!(matches!(
            ledger.grant_access("alice", "nope", "bob").await,
            Err(RecollectError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_per_user_and_chronological() {
        let ledger = InMemoryLedger::new();
        ledger.record_memory(&record("new", "alice", 1)).await.unwrap();
        ledger.record_memory(&record("old", "alice", 10)).await.unwrap();
        ledger.record_memory(&record("theirs", "bob", 3)).await.unwrap();

        let ids: Vec<_> = ledger
            .list_user_memories("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn test_digest_is_stable() {
        let ledger = InMemoryLedger::new();
        let r = record("m1", "alice", 0);
        let a = ledger.record_memory(&r).await.unwrap();
        let b = ledger.record_memory(&r).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
