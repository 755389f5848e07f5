//! DaemonClient against a mock daemon

use recollect::pipeline::{JobState, MemoryInput, SubmitOptions};
use recollect::retrieval::UnifiedMemoryQuery;
use recollect::server::SubmitRequest;
use recollect_cli::DaemonClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn job_body(state: &str) -> serde_json::Value {
    json!({
        "id": "job-1",
        "memory_id": "m1",
        "user_id": "u1",
        "stage": "storage",
        "state": state,
        "started_at": "2026-01-01T00:00:00Z",
        "ended_at": null,
        "processing_time_ms": null,
        "error": null
    })
}

#[tokio::test]
async fn test_submit_posts_flattened_memory() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/memories"))
        .and(body_partial_json(json!({"id": "m1", "user_id": "u1", "content": "hello"})))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({"job_id": "job-1", "memory_id": "m1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = DaemonClient::new(&server.uri()).unwrap();
    let response = client
        .submit(&SubmitRequest {
            memory: MemoryInput::new("m1", "u1", "hello"),
            options: SubmitOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(response.job_id, "job-1");
}

#[tokio::test]
async fn test_job_passes_wait_parameter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job-1"))
        .and(query_param("wait_ms", "250"))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_body("completed")))
        .mount(&server)
        .await;

    let client = DaemonClient::new(&server.uri()).unwrap();
    let status = client.job("job-1", Some(250)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert!(!status.cached);
}

#[tokio::test]
async fn test_error_body_becomes_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/search"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "validation", "message": "user_id is required"}
        })))
        .mount(&server)
        .await;

    let client = DaemonClient::new(&server.uri()).unwrap();
    let err = client
        .search(&UnifiedMemoryQuery::new("coffee", "u1"))
        .await
        .unwrap_err();
    assert!(err.0.starts_with("validation (400"));
    assert!(err.0.ends_with("user_id is required"));
}

#[tokio::test]
async fn test_plain_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/admin/stats"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = DaemonClient::new(&server.uri()).unwrap();
    let err = client.stats().await.unwrap_err();
    assert!(err.0.contains("503"));
}
