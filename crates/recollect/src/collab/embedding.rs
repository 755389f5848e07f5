//! Embedding collaborators
//!
//! `LocalEmbedder` runs a fastembed model on the blocking pool.
//! `RemoteEmbedder` calls any OpenAI-compatible `/embeddings` endpoint.

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collab::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{RecollectError, Result};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Resolve a model name to the fastembed model and its output dimension
fn resolve_model(name: &str) -> Result<(FastEmbedModel, usize)> {
    let resolved = match name {
        "multilingual-e5-small" | "MultilingualE5Small" => (FastEmbedModel::MultilingualE5Small, 384),
        "multilingual-e5-base" | "MultilingualE5Base" => (FastEmbedModel::MultilingualE5Base, 768),
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (FastEmbedModel::AllMiniLML6V2, 384),
        "bge-small-en-v1.5" | "BGESmallENV15" => (FastEmbedModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "BGEBaseENV15" => (FastEmbedModel::BGEBaseENV15, 768),
        other => {
            return Err(RecollectError::Config(format!(
                "Unknown embedding model '{other}'"
            )));
        }
    };
    Ok(resolved)
}

/// In-process embedding model backed by fastembed
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    name: String,
    dimension: usize,
}

impl LocalEmbedder {
    /// Load the named model, downloading it on first use
    pub fn new(model_name: &str) -> Result<Self> {
        let (model, dimension) = resolve_model(model_name)?;
        info!(model = model_name, dimension, "Loading local embedding model");

        let model = TextEmbedding::try_new(InitOptions::new(model))
            .map_err(|e| RecollectError::Embedding(e.to_string()))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            name: model_name.to_string(),
            dimension,
        })
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
            model
                .embed(texts, None)
                .map_err(|e| RecollectError::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| RecollectError::Embedding(format!("Embedding task failed: {e}")))?
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecollectError::Embedding("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.run(texts.to_vec()).await?;
        debug!(count = embeddings.len(), "Generated local embeddings");
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// OpenAI-compatible embeddings request
#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Embedding client for OpenAI-compatible HTTP APIs
#[derive(Debug)]
pub struct RemoteEmbedder {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    retry: RetryPolicy,
}

impl RemoteEmbedder {
    /// Build a client from config, reading the API key from the configured
    /// environment variable when one is named
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(env::var(var).map_err(|_| {
                RecollectError::Config(format!("API key env var '{var}' not set"))
            })?),
            None => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RecollectError::Embedding(e.to_string()))?;

        let url = format!("{}/embeddings", config.api_url.trim_end_matches('/'));
        info!(model = %config.model, url = %url, "RemoteEmbedder initialized");

        Ok(Self {
            client,
            url,
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn call_api(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingsRequest {
            model: &self.model,
            input: texts,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RecollectError::unavailable("embedding-api", e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RecollectError::unavailable(
                "embedding-api",
                format!("API returned {status}"),
            ));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RecollectError::Embedding(format!(
                "API returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| RecollectError::Embedding(format!("Invalid response: {e}")))?;

        // Order by the reported index when present; missing slots stay empty
        let mut out = vec![Vec::new(); texts.len()];
        for (position, datum) in parsed.data.into_iter().enumerate() {
            let slot = datum.index.unwrap_or(position);
            if let Some(entry) = out.get_mut(slot) {
                *entry = datum.embedding;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let batch = [text.to_string()];
        let vector = self
            .embed_batch(&batch)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        if vector.is_empty() {
            return Err(RecollectError::Embedding("No embedding returned".to_string()));
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        retry_with_backoff(&self.retry, "embedding request", || self.call_api(texts)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote_config(api_url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "remote".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_url,
            api_key_env: None,
            dimension: 3,
            batch_size: 32,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_resolve_known_and_unknown_models() {
        assert_eq!(resolve_model("multilingual-e5-small").unwrap().1, 384);
        assert_eq!(resolve_model("bge-base-en-v1.5").unwrap().1, 768);
        assert!(matches!(
            resolve_model("gpt-2"),
            Err(RecollectError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_embed_batch_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.0, 1.0, 0.0], "index": 1},
                    {"embedding": [1.0, 0.0, 0.0], "index": 0}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(&remote_config(server.uri())).unwrap();
        let texts = vec!["first".to_string(), "second".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_remote_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.5, 0.5, 0.5]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_EMBED_KEY", "sk-test") };
        let mut config = remote_config(server.uri());
        config.api_key_env = Some("RECOLLECT_TEST_EMBED_KEY".to_string());
        let embedder = RemoteEmbedder::new(&config).unwrap();

        let vector = embedder.embed_text("hello").await.unwrap();
        assert_eq!(vector.len(), 3);
    }

    #[tokio::test]
    async fn test_remote_retries_on_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0, 2.0, 3.0], "index": 0}]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(&remote_config(server.uri()))
            .unwrap()
            .with_retry(
                RetryPolicy::default()
                    .with_initial_delay(Duration::from_millis(5))
                    .without_jitter(),
            );

        let vector = embedder.embed_text("retry me").await.unwrap();
        assert_eq!(vector, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_remote_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(&remote_config(server.uri())).unwrap();
        let err = embedder.embed_text("x").await.unwrap_err();
        assert!(matches!(err, RecollectError::Embedding(ref m) if m.contains("400")));
    }

    #[test]
    fn test_missing_api_key_env_is_config_error() {
        let mut config = remote_config("http://localhost:1".to_string());
        config.api_key_env = Some("RECOLLECT_DEFINITELY_UNSET_VAR".to_string());
        assert!(matches!(
            RemoteEmbedder::new(&config),
            Err(RecollectError::Config(_))
        ));
    }

    #[tokio::test]
    #[cfg_attr(not(feature = "ml-tests"), ignore)]
    async fn test_local_embedder_dimension() {
        let embedder = LocalEmbedder::new("multilingual-e5-small").unwrap();
        let vector = embedder.embed_text("Hello, world!").await.unwrap();
        assert_eq!(vector.len(), embedder.dimension());
    }
}
