//! Thin HTTP client for the daemon's JSON API

use recollect::admin::DaemonStats;
use recollect::pipeline::JobStatus;
use recollect::retrieval::{RetrievalContext, UnifiedMemoryQuery};
use recollect::server::{FlushResponse, SubmitRequest, SubmitResponse};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{CliError, CliResult};

pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:7777";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    base: Url,
    http: Client,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> CliResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> CliResult<Url> {
        Ok(self.base.join(path)?)
    }

    /// Decode a success body, or turn the daemon's error body into a message
    async fn decode<T: DeserializeOwned>(response: Response) -> CliResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let text = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => CliError::daemon(status, Some(&body.error.kind), &body.error.message),
            Err(_) => CliError::daemon(status, None, &text),
        })
    }

    pub async fn submit(&self, request: &SubmitRequest) -> CliResult<SubmitResponse> {
        let response = self
            .http
            .post(self.endpoint("v1/memories")?)
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn job(&self, id: &str, wait_ms: Option<u64>) -> CliResult<JobStatus> {
        let mut url = self.endpoint("v1/jobs/")?;
        url.path_segments_mut()
            .map_err(|_| CliError("Daemon URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(id);
        if let Some(wait_ms) = wait_ms {
            url.query_pairs_mut().append_pair("wait_ms", &wait_ms.to_string());
        }
        Self::decode(self.http.get(url).send().await?).await
    }

    pub async fn flush(&self) -> CliResult<FlushResponse> {
        let response = self
            .http
            .post(self.endpoint("v1/pipeline/flush")?)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn search(&self, query: &UnifiedMemoryQuery) -> CliResult<RetrievalContext> {
        let response = self
            .http
            .post(self.endpoint("v1/search")?)
            .json(query)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn stats(&self) -> CliResult<DaemonStats> {
        Self::decode(self.http.get(self.endpoint("admin/stats")?).send().await?).await
    }
}
