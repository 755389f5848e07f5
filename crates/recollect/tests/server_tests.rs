//! HTTP API tests driven through the router without binding a socket

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use common::Harness;
use recollect::admin::DaemonStats;
use recollect::pipeline::{JobState, JobStatus};
use recollect::retrieval::RetrievalContext;
use recollect::server::{AppState, FlushResponse, SubmitResponse, create_router};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

fn app(h: &Harness) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(
        h.pipeline.clone(),
        h.retrieval.clone(),
        Some(h.decryption.clone()),
    ));
    (create_router(state.clone(), Duration::from_secs(5)), state)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (router, _) = app(&h);

    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_submit_then_search() {
    let h = Harness::new();
    let (router, state) = app(&h);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/memories",
            serde_json::json!({"id": "m1", "user_id": "u1", "content": "likes dark roast coffee"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let submitted: SubmitResponse = read_json(response).await;
    assert_eq!(submitted.memory_id, "m1");

    let response = router
        .clone()
        .oneshot(get(&format!("/v1/jobs/{}", submitted.job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: JobStatus = read_json(response).await;
    assert_eq!(status.state, JobState::Pending);

    state.pipeline.drain().await.unwrap();

    let response = router
        .clone()
        .oneshot(get(&format!("/v1/jobs/{}?wait_ms=100", submitted.job_id)))
        .await
        .unwrap();
    let status: JobStatus = read_json(response).await;
    assert_eq!(status.state, JobState::Completed);

    let response = router
        .oneshot(post_json(
            "/v1/search",
            serde_json::json!({"query": "dark roast coffee", "user_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let context: RetrievalContext = read_json(response).await;
    assert!(context.success);
    assert_eq!(context.results.len(), 1);
    assert_eq!(context.results[0].id, "m1");
}

#[tokio::test]
async fn test_flush_reports_processed_items() {
    let h = Harness::new();
    let (router, _) = app(&h);

    for id in ["m1", "m2"] {
        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/memories",
                serde_json::json!({"id": id, "user_id": "u1", "content": format!("note {id}")}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    // Items forwarded during a flush may wait for the next one
    let mut processed = 0;
    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(post_json("/v1/pipeline/flush", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let flushed: FlushResponse = read_json(response).await;
        processed += flushed.processed;
        if flushed.queued == 0 {
            break;
        }
    }
    // Two memories through three stages
    assert_eq!(processed, 6);
    assert_eq!(h.index.len(), 2);
}

#[tokio::test]
async fn test_invalid_submission_is_bad_request() {
    let h = Harness::new();
    let (router, _) = app(&h);

    let response = router
        .oneshot(post_json(
            "/v1/memories",
            serde_json::json!({"user_id": "u1", "content": "x", "importance": 42.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["error"]["type"], "validation");
    assert!(body["error"]["message"].as_str().unwrap().contains("importance"));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = Harness::new();
    let (router, _) = app(&h);

    let response = router.oneshot(get("/v1/jobs/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_search_without_text_is_bad_request() {
    let h = Harness::new();
    let (router, _) = app(&h);

    let response = router
        .oneshot(post_json(
            "/v1/search",
            serde_json::json!({"query": "", "user_id": "u1", "search_type": "vector"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_stats() {
    let h = Harness::new();
    let (router, state) = app(&h);
    state
        .pipeline
        .add_memory_to_pipeline(
            recollect::pipeline::MemoryInput::new("m1", "u1", "queued"),
            Default::default(),
        )
        .unwrap();

    let response = router.oneshot(get("/admin/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats: DaemonStats = read_json(response).await;
    let names: Vec<&str> = stats.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["embedding", "indexing", "storage"]);
    assert_eq!(stats.queued(), 1);
    assert_eq!(stats.jobs.pending, 1);
    let decryption = stats.decryption.unwrap();
    assert_eq!(decryption.key_servers, 1);
    assert_eq!(decryption.healthy_key_servers, 1);
}
