//! Integration tests for batch decryption, session pooling and failover

use std::sync::Arc;

use chrono::Utc;
use recollect::RecollectError;
use recollect::collab::{InMemoryLedger, KeyServer, MemoryLedger, MemoryRecord};
use recollect::config::DecryptionConfig;
use recollect::decrypt::{DecryptionDeps, DecryptionRequest, MemoryDecryptionPipeline};
use recollect::testing::{MemoryBlobStore, MockKeyServer, MockSessionIssuer, seal_for_tests};

struct Setup {
    pipeline: MemoryDecryptionPipeline,
    ledger: Arc<InMemoryLedger>,
    servers: Vec<Arc<MockKeyServer>>,
    issuer: Arc<MockSessionIssuer>,
}

fn setup(server_names: &[&str]) -> Setup {
    let ledger = Arc::new(InMemoryLedger::new());
    let issuer = Arc::new(MockSessionIssuer::new());
    let servers: Vec<Arc<MockKeyServer>> = server_names
        .iter()
        .map(|name| Arc::new(MockKeyServer::new(*name)))
        .collect();
    let pipeline = MemoryDecryptionPipeline::new(
        DecryptionConfig {
            retry_base_delay_ms: 5,
            ..DecryptionConfig::default()
        },
        DecryptionDeps {
            issuer: issuer.clone(),
            key_servers: servers
                .iter()
                .map(|s| s.clone() as Arc<dyn KeyServer>)
                .collect(),
            ledger: ledger.clone(),
            blobs: Arc::new(MemoryBlobStore::new()),
        },
    );
    Setup {
        pipeline,
        ledger,
        servers,
        issuer,
    }
}

async fn record(ledger: &InMemoryLedger, id: &str, owner: &str, hash: &str) {
    ledger
        .record_memory(&MemoryRecord {
            id: id.into(),
            owner: owner.into(),
            category: "general".into(),
            importance: 5.0,
            tags: vec![],
            content_type: "text/plain".into(),
            created_at: Utc::now(),
            blob_id: None,
            content_hash: hash.into(),
            encrypted: true,
            content: None,
        })
        .await
        .unwrap();
}

/// Five sealed notes owned by u1; the third declares the wrong hash
async fn five_requests(ledger: &InMemoryLedger) -> Vec<DecryptionRequest> {
    let mut requests = Vec::new();
    for i in 1..=5 {
        let id = format!("m{i}");
        let (ciphertext, hash) = seal_for_tests(&format!("note {i}"));
        let declared = if i == 3 { "0".repeat(64) } else { hash };
        record(ledger, &id, "u1", &declared).await;
        requests.push(DecryptionRequest::new(id, "u1", ciphertext, declared));
    }
    requests
}

#[tokio::test]
async fn test_batch_isolates_integrity_failure() {
    let s = setup(&["ks1"]);
    let requests = five_requests(&s.ledger).await;

    let batch = s.pipeline.decrypt_memory_batch(requests).await.unwrap();
    assert_eq!(batch.stats.total, 5);
    assert_eq!(batch.stats.successful, 4);
    assert_eq!(batch.stats.failed, 1);
    assert_eq!(batch.stats.retry_rounds, 0);

    let ids: Vec<&str> = batch.successful.iter().map(|r| r.memory_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m4", "m5"]);
    assert_eq!(batch.successful[2].text(), "note 4");
    assert!(batch.successful.iter().all(|r| r.is_verified));

    let failed = &batch.failed[0];
    assert_eq!(failed.memory_id, "m3");
    assert_eq!(failed.attempts, 1);
    assert!(matches!(failed.error, RecollectError::Integrity { .. }));
    assert_eq!(s.pipeline.stats().integrity_failures, 1);
}

#[tokio::test]
async fn test_batch_shares_one_session_key() {
    let s = setup(&["ks1"]);
    let requests = five_requests(&s.ledger).await;

    s.pipeline.decrypt_memory_batch(requests).await.unwrap();
    assert_eq!(s.issuer.issued_for("u1"), 1);
    assert_eq!(s.pipeline.session_key_count(), 1);
}

#[tokio::test]
async fn test_second_batch_is_served_from_content_cache() {
    let s = setup(&["ks1"]);
    let requests = five_requests(&s.ledger).await;

    s.pipeline.decrypt_memory_batch(requests.clone()).await.unwrap();
    let calls = s.servers[0].call_count();

    let again = s.pipeline.decrypt_memory_batch(requests).await.unwrap();
    assert_eq!(again.successful.len(), 4);
    assert!(again.successful.iter().all(|r| r.from_cache));
    // The unverified item is never cached and goes back to the key server
    assert_eq!(s.servers[0].call_count(), calls + 1);
}

#[tokio::test]
async fn test_failover_to_healthy_key_server() {
    let s = setup(&["ks1", "ks2"]);
    s.servers[0].set_down(true);

    let (ciphertext, hash) = seal_for_tests("route around the outage");
    record(&s.ledger, "m1", "u1", &hash).await;

    let result = s
        .pipeline
        .decrypt_memory(DecryptionRequest::new("m1", "u1", ciphertext, hash))
        .await
        .unwrap();
    assert_eq!(result.text(), "route around the outage");
    assert_eq!(result.key_server.as_deref(), Some("ks2"));
}

#[tokio::test]
async fn test_grantee_decrypts_under_own_session() {
    let s = setup(&["ks1"]);
    let (ciphertext, hash) = seal_for_tests("shared recipe");
    record(&s.ledger, "m1", "u1", &hash).await;
    s.ledger.grant_access("u1", "m1", "u2").await.unwrap();

    let result = s
        .pipeline
        .decrypt_memory(DecryptionRequest::new("m1", "u2", ciphertext, hash))
        .await
        .unwrap();
    assert_eq!(result.text(), "shared recipe");
    assert_eq!(s.issuer.issued_for("u2"), 1);
    assert_eq!(s.issuer.issued_for("u1"), 0);
}
