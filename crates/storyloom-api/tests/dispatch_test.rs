//! Dispatch API tests against the real router with an in-memory job store

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use storyloom_api::{create_router, AppState};
use storyloom_core::models::{JobStatus, JobType};
use storyloom_core::queue::NoopQueue;
use storyloom_core::repository::{InMemoryJobStore, JobStore};

fn app(store: Arc<InMemoryJobStore>) -> axum::Router {
    create_router(AppState::new(store, Arc::new(NoopQueue)))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn happy_path_dispatch_creates_pending_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store.clone());

    let response = app
        .oneshot(post_json(
            "/generation/story-script",
            serde_json::json!({ "theme": "A friendly dragon" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["ok"], true);

    // storyId is a freshly minted UUID when the caller sends none.
    let story_id = body["storyId"].as_str().unwrap();
    assert!(Uuid::parse_str(story_id).is_ok());

    let job_ids = body["jobIds"].as_array().unwrap();
    assert_eq!(job_ids.len(), 1);

    let job_id = Uuid::parse_str(job_ids[0].as_str().unwrap()).unwrap();
    let job = store.job(job_id).await.unwrap();
    assert_eq!(job.job_type, JobType::StoryScript);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.payload["theme"], "A friendly dragon");
    assert_eq!(job.payload["type"], "story_script");
}

#[tokio::test]
async fn missing_theme_is_a_client_error() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store.clone());

    let response = app
        .oneshot(post_json(
            "/generation/story-script",
            serde_json::json!({ "tone": "warm" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "missing theme");

    // Input errors never create jobs.
    assert!(store.jobs_of_type(JobType::StoryScript).await.is_empty());
}

#[tokio::test]
async fn blank_theme_is_rejected_too() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store);

    let response = app
        .oneshot(post_json(
            "/generation/story-script",
            serde_json::json!({ "theme": "   " }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn caller_supplied_story_id_is_kept() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store);

    let response = app
        .oneshot(post_json(
            "/generation/story-script",
            serde_json::json!({
                "storyId": "weekly-2026-08-01",
                "theme": "sharing toys",
                "ageRange": "0-6",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["storyId"], "weekly-2026-08-01");
}

#[tokio::test]
async fn job_endpoint_returns_status() {
    let store = Arc::new(InMemoryJobStore::new());

    let job_id = store
        .create_job(None, JobType::StoryScript, serde_json::json!({ "theme": "x" }))
        .await
        .unwrap();

    let app = app(store);
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/generation/jobs/{}", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["job"]["status"], "pending");
    assert_eq!(body["job"]["retryCount"], 0);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/generation/jobs/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failures_endpoint_lists_unresolved_rows() {
    let store = Arc::new(InMemoryJobStore::new());

    store
        .record_failure(&storyloom_core::models::NewFailure {
            job_id: None,
            error_code: "provider".to_string(),
            error_message: "stage=story attempt=3: Provider error (500): boom".to_string(),
        })
        .await
        .unwrap();

    let app = app(store);
    let response = app
        .oneshot(Request::builder().uri("/generation/failures").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let failures = body["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["errorCode"], "provider");
}

#[tokio::test]
async fn health_endpoint_is_up() {
    let store = Arc::new(InMemoryJobStore::new());
    let app = app(store);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
