use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;
use storyloom_core::models::JobType;
use storyloom_core::queue::Envelope;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generation/story-script", post(create_story_script))
        .route("/generation/jobs/:id", get(get_job))
        .route("/generation/failures", get(list_failures))
}

/// Story request body; everything except the theme is optional
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoryScriptRequest {
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub age_range: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub initiated_by: Option<String>,
}

/// Admit one story request: create the pending story_script job, enqueue
/// its reference best-effort, and return the ids synchronously. The AI
/// provider is never called here.
async fn create_story_script(
    State(state): State<AppState>,
    Json(body): Json<CreateStoryScriptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let theme = body
        .theme
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingTheme)?;

    let story_id = body
        .story_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let payload = serde_json::json!({
        "type": "story_script",
        "storyId": story_id,
        "theme": theme,
        "tone": body.tone,
        "ageRange": body.age_range,
        "scheduledAt": body.scheduled_at,
        "initiatedBy": body.initiated_by,
    });

    let job_id = state
        .store
        .create_job(None, JobType::StoryScript, payload)
        .await?;

    tracing::info!(story_id = %story_id, job_id = %job_id, "Story request admitted");

    // Best-effort: a push failure leaves the job pending for the
    // reconciler, the caller still gets its ids.
    if let Err(e) = state.queue.push(&Envelope::new(job_id)).await {
        tracing::warn!(job_id = %job_id, "Could not enqueue story_script job: {}", e);
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "storyId": story_id,
        "jobIds": [job_id],
    })))
}

/// Job status polling for the admin UI
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {}", id)))?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "job": {
            "id": job.id,
            "storyId": job.story_id,
            "jobType": job.job_type,
            "status": job.status,
            "retryCount": job.retry_count,
            "resultUri": job.result_uri,
            "failureReason": job.failure_reason,
            "createdAt": job.created_at,
            "updatedAt": job.updated_at,
        },
    })))
}

/// Unresolved failure rows, newest first
async fn list_failures(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let failures = state.store.unresolved_failures(50).await?;

    let rows: Vec<serde_json::Value> = failures
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "jobId": f.job_id,
                "errorCode": f.error_code,
                "errorMessage": f.error_message,
                "createdAt": f.created_at,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "ok": true,
        "failures": rows,
    })))
}
