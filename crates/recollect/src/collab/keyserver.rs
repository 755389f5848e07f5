//! HTTP key-server client
//!
//! Speaks a small JSON protocol: `POST /v1/session-keys` issues a session
//! key, `POST /v1/decrypt` decrypts a base64 ciphertext under one, and
//! `GET /health` reports liveness.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collab::{KeyServer, SessionKey, SessionKeyIssuer};
use crate::error::{RecollectError, Result};

#[derive(Debug, Serialize)]
struct SessionKeyRequest<'a> {
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionKeyResponse {
    handle: String,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DecryptRequest<'a> {
    user_id: &'a str,
    session_key: &'a str,
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

/// Client for one key-server endpoint
#[derive(Debug, Clone)]
pub struct HttpKeyServer {
    name: String,
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpKeyServer {
    pub fn new(name: impl Into<String>, base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| RecollectError::Config(format!("Invalid key server URL '{base_url}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecollectError::Config(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn transport_error(&self, e: reqwest::Error) -> RecollectError {
        if e.is_timeout() {
            RecollectError::Timeout {
                operation: format!("{} request", self.name),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            RecollectError::unavailable(self.name.clone(), e.to_string())
        }
    }

    async fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                RecollectError::AccessDenied(format!("{}: {body}", self.name))
            }
            StatusCode::NOT_FOUND => RecollectError::NotFound(format!("{}: {body}", self.name)),
            StatusCode::TOO_MANY_REQUESTS => {
                RecollectError::unavailable(self.name.clone(), format!("rate limited: {body}"))
            }
            s if s.is_server_error() => {
                RecollectError::unavailable(self.name.clone(), format!("{s}: {body}"))
            }
            s => RecollectError::Decryption(format!("{} returned {s}: {body}", self.name)),
        })
    }
}

#[async_trait]
impl SessionKeyIssuer for HttpKeyServer {
    async fn create_session_key(&self, user_id: &str) -> Result<SessionKey> {
        let response = self
            .client
            .post(self.endpoint("/v1/session-keys"))
            .json(&SessionKeyRequest { user_id })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let parsed: SessionKeyResponse = self
            .check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RecollectError::Decryption(format!("Invalid session key response: {e}")))?;

        debug!(server = %self.name, user_id, "Issued session key");
        Ok(SessionKey {
            user_id: user_id.to_string(),
            handle: parsed.handle,
            issued_at: parsed.issued_at.unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl KeyServer for HttpKeyServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decrypt(&self, ciphertext: &[u8], key: &SessionKey, user_id: &str) -> Result<Bytes> {
        let request = DecryptRequest {
            user_id,
            session_key: &key.handle,
            ciphertext: BASE64.encode(ciphertext),
        };

        let response = self
            .client
            .post(self.endpoint("/v1/decrypt"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let parsed: DecryptResponse = self
            .check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RecollectError::Decryption(format!("Invalid decrypt response: {e}")))?;

        BASE64
            .decode(parsed.plaintext)
            .map(Bytes::from)
            .map_err(|e| RecollectError::Decryption(format!("Plaintext is not base64: {e}")))
    }

    async fn is_available(&self) -> bool {
        match self.client.get(self.endpoint("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
