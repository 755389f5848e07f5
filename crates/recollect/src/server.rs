//! HTTP surface of the daemon
//!
//! Exposes ingestion, job inspection, queue flushing and search as JSON
//! endpoints, plus the admin routes. Errors are returned as
//! `{"error": {"type", "message"}}` with a status derived from the error kind.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::handlers::{events_handler, stats_handler};
use crate::config::ServerConfig;
use crate::decrypt::MemoryDecryptionPipeline;
use crate::error::{ErrorKind, RecollectError, Result};
use crate::pipeline::{BatchManager, JobStatus, MemoryInput, SubmitOptions};
use crate::retrieval::{MemoryRetrievalService, RetrievalContext, UnifiedMemoryQuery};

/// Shared application state for all handlers
pub struct AppState {
    pub pipeline: BatchManager,
    pub retrieval: MemoryRetrievalService,
    /// Present when key servers are configured
    pub decryption: Option<Arc<MemoryDecryptionPipeline>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        pipeline: BatchManager,
        retrieval: MemoryRetrievalService,
        decryption: Option<Arc<MemoryDecryptionPipeline>>,
    ) -> Self {
        Self {
            pipeline,
            retrieval,
            decryption,
            started_at: Instant::now(),
        }
    }
}

/// A `RecollectError` rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub RecollectError);

impl From<RecollectError> for ApiError {
    fn from(e: RecollectError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        if matches!(self.0, RecollectError::Timeout { .. }) {
            return StatusCode::GATEWAY_TIMEOUT;
        }
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        error_response(status, self.0.kind().as_str(), &self.0.to_string())
    }
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of `POST /v1/memories`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub memory: MemoryInput,
    #[serde(default)]
    pub options: SubmitOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub memory_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushResponse {
    pub processed: usize,
    pub queued: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    /// Block up to this long for the job to finish
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/v1/memories", post(submit_handler))
        .route("/v1/jobs/{id}", get(job_handler))
        .route("/v1/pipeline/flush", post(flush_handler))
        .route("/v1/search", post(search_handler))
        .route("/admin/stats", get(stats_handler))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/events", get(events_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `config.listen_addr` and serve until Ctrl+C or SIGTERM
pub async fn serve(config: &ServerConfig, state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| RecollectError::Config(format!("Invalid listen address: {e}")))?;

    let app = create_router(state, Duration::from_secs(config.request_timeout_secs));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        RecollectError::unavailable("http listener", format!("Failed to bind to {addr}: {e}"))
    })?;

    tracing::info!("Listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RecollectError::Io(format!("Server error: {e}")))?;

    tracing::info!("HTTP server shut down gracefully");
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let memory_id = request.memory.id.clone();
    let job_id = state
        .pipeline
        .add_memory_to_pipeline(request.memory, request.options)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id, memory_id })))
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<JobStatus>> {
    let not_found = || ApiError(RecollectError::NotFound(format!("job {id}")));
    let Some(wait_ms) = query.wait_ms else {
        return state.pipeline.job_status(&id).map(Json).ok_or_else(not_found);
    };

    match state
        .pipeline
        .await_job(&id, Duration::from_millis(wait_ms))
        .await
    {
        Ok(status) => Ok(Json(status)),
        // Still running: report where it is
        Err(RecollectError::Timeout { .. }) => {
            state.pipeline.job_status(&id).map(Json).ok_or_else(not_found)
        }
        Err(e) => Err(e.into()),
    }
}

async fn flush_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<FlushResponse>> {
    let processed = state.pipeline.process_all_batches().await?;
    Ok(Json(FlushResponse {
        processed,
        queued: state.pipeline.queued(),
    }))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<UnifiedMemoryQuery>,
) -> ApiResult<Json<RetrievalContext>> {
    Ok(Json(state.retrieval.search_memories(query).await?))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
