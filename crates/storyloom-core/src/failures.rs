//! Error recorder
//!
//! The failure table is the single source of truth for post-mortem
//! analysis: every unrecoverable error lands here exactly once, tagged
//! with its stage and attempt. An optional webhook notification fires
//! non-blocking; webhook failures are logged, never propagated.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::models::{FailedJob, NewFailure};
use crate::repository::JobStore;
use crate::{Error, Result};

/// Where and when a failure happened
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub job_id: Option<Uuid>,
    pub story_ref: Option<String>,
    /// Stage name: story/translation/vocabulary, image/audio/video,
    /// persistence, upstash_push, worker
    pub stage: String,
    pub attempt: i32,
    pub extra: serde_json::Value,
}

impl FailureContext {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            job_id: None,
            story_ref: None,
            stage: stage.into(),
            attempt: 1,
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_story_ref(mut self, story_ref: impl Into<String>) -> Self {
        self.story_ref = Some(story_ref.into());
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Retry ceiling for the status-based policy below
const POLICY_MAX_ATTEMPTS: i32 = 3;

/// Status-based retry policy: retry while attempts remain and the error is
/// a provider 5xx or 429. Aborted calls never retry.
pub fn should_retry(error: &Error, attempt: i32) -> bool {
    if attempt >= POLICY_MAX_ATTEMPTS {
        return false;
    }

    if error.to_string().contains("Abort") {
        return false;
    }

    match error.provider_status() {
        Some(status) => status >= 500 || status == 429,
        None => false,
    }
}

pub struct FailureRecorder {
    store: Arc<dyn JobStore>,
    client: reqwest::Client,
    config: NotificationConfig,
}

impl FailureRecorder {
    pub fn new(store: Arc<dyn JobStore>, config: NotificationConfig) -> Self {
        Self { store, client: reqwest::Client::new(), config }
    }

    /// Classify and store one unrecoverable failure
    pub async fn record(&self, context: &FailureContext, error: &Error) -> Result<FailedJob> {
        let message = self.render_message(context, error);

        tracing::error!(
            stage = %context.stage,
            attempt = context.attempt,
            job_id = ?context.job_id,
            "Recording failure: {}",
            error
        );

        let row = self
            .store
            .record_failure(&NewFailure {
                job_id: context.job_id,
                error_code: error.category().to_string(),
                error_message: message.clone(),
            })
            .await?;

        self.notify(message);

        Ok(row)
    }

    fn render_message(&self, context: &FailureContext, error: &Error) -> String {
        let mut message = format!(
            "stage={} attempt={}: {}",
            context.stage, context.attempt, error
        );

        if let Some(story_ref) = &context.story_ref {
            message.push_str(&format!(" (story={})", story_ref));
        }

        if !context.extra.is_null() {
            message.push_str(&format!(" extra={}", context.extra));
        }

        message
    }

    /// Fire-and-forget webhook notification
    fn notify(&self, message: String) {
        if !self.config.enabled {
            return;
        }

        let Some(webhook) = self.config.slack_webhook.clone() else {
            return;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({
                "text": format!("Generation pipeline failure: {}", message),
            });

            if let Err(e) = client.post(&webhook).json(&body).send().await {
                tracing::warn!("Failure webhook notification failed: {}", e);
            }
        });
    }
}
