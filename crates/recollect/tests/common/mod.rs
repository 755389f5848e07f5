//! Shared wiring for the integration tests
//!
//! Builds a pipeline, a retrieval service and a decryption pipeline over the
//! deterministic collaborators in `recollect::testing`, wired the same way the
//! daemon wires them.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use recollect::cache::CacheConfig;
use recollect::collab::{
    BlobStore, Embedder, InMemoryKnowledgeGraph, InMemoryLedger, InMemoryVectorIndex, KeyServer,
    KnowledgeGraph, MemoryLedger, VectorIndex,
};
use recollect::config::{DecryptionConfig, IndexConfig, PipelineConfig, RetrievalConfig};
use recollect::decrypt::{DecryptionDeps, MemoryDecryptionPipeline};
use recollect::pipeline::{BatchManager, PipelineDeps};
use recollect::retrieval::{MemoryRetrievalService, RetrievalDeps};
use recollect::retry::RetryPolicy;
use recollect::testing::{HashEmbedder, MemoryBlobStore, MockKeyServer, MockSessionIssuer};

pub struct Harness {
    pub embedder: Arc<HashEmbedder>,
    pub index: Arc<InMemoryVectorIndex>,
    pub graph: Arc<InMemoryKnowledgeGraph>,
    pub ledger: Arc<InMemoryLedger>,
    pub blobs: Arc<MemoryBlobStore>,
    pub key_server: Arc<MockKeyServer>,
    pub issuer: Arc<MockSessionIssuer>,
    pub decryption: Arc<MemoryDecryptionPipeline>,
    pub retrieval: MemoryRetrievalService,
    pub pipeline: BatchManager,
}

pub fn decryption_config() -> DecryptionConfig {
    DecryptionConfig {
        retry_base_delay_ms: 10,
        ..DecryptionConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        let embedder = Arc::new(HashEmbedder::new());
        let index = Arc::new(InMemoryVectorIndex::default());
        let graph = Arc::new(InMemoryKnowledgeGraph::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let key_server = Arc::new(MockKeyServer::new("ks1"));
        let issuer = Arc::new(MockSessionIssuer::new());

        let decryption = Arc::new(MemoryDecryptionPipeline::new(
            decryption_config(),
            DecryptionDeps {
                issuer: issuer.clone(),
                key_servers: vec![key_server.clone() as Arc<dyn KeyServer>],
                ledger: ledger.clone(),
                blobs: blobs.clone(),
            },
        ));

        let retrieval = MemoryRetrievalService::with_retry_policy(
            RetrievalConfig::default(),
            &IndexConfig::default(),
            RetrievalDeps {
                embedder: embedder.clone() as Arc<dyn Embedder>,
                index: index.clone() as Arc<dyn VectorIndex>,
                graph: graph.clone() as Arc<dyn KnowledgeGraph>,
                ledger: ledger.clone() as Arc<dyn MemoryLedger>,
                blobs: blobs.clone() as Arc<dyn BlobStore>,
                decryption: Some(decryption.clone()),
            },
            RetryPolicy::none(),
        );

        let pipeline = BatchManager::with_retry_policy(
            PipelineConfig::default(),
            CacheConfig::new(1_000, Duration::from_secs(3_600)),
            PipelineDeps {
                embedder: embedder.clone(),
                index: index.clone(),
                graph: graph.clone(),
                blobs: blobs.clone(),
                ledger: ledger.clone(),
            },
            RetryPolicy::none(),
        )
        .with_observer(Arc::new(retrieval.clone()));

        Self {
            embedder,
            index,
            graph,
            ledger,
            blobs,
            key_server,
            issuer,
            decryption,
            retrieval,
            pipeline,
        }
    }
}
