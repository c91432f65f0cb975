//! Story orchestrator
//!
//! Sequences the three text stages for one story request: script,
//! translation, vocabulary. Each stage's output is strictly validated
//! before the next stage sees it. Stage errors are surfaced to the error
//! recorder with their context and re-raised unchanged so the worker can
//! apply its retry policy. The orchestrator never writes to the database;
//! only the persistence coordinator does.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ai::{ChatClient, ChatParams, TokenUsage};
use crate::assemble::{
    assemble_story, assemble_translation, assemble_vocabulary, StoryDraft, TranslationDraft,
    VocabularyDraft,
};
use crate::failures::{FailureContext, FailureRecorder};
use crate::prompts;
use crate::Result;

const STORY_TEMPERATURE: f32 = 0.8;
const TRANSLATION_TEMPERATURE: f32 = 0.2;
const VOCABULARY_TEMPERATURE: f32 = 0.2;

/// One story request as carried in the story_script job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRequest {
    pub story_id: String,
    pub theme: String,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub age_range: Option<String>,
}

/// Per-stage token usage, aggregated for the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageUsages {
    pub story: TokenUsage,
    pub translation: TokenUsage,
    pub vocabulary: TokenUsage,
}

impl StageUsages {
    pub fn total_tokens(&self) -> u32 {
        self.story.total_tokens + self.translation.total_tokens + self.vocabulary.total_tokens
    }
}

/// Everything the text pipeline produced for one story
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub story: StoryDraft,
    pub translation: TranslationDraft,
    pub vocabulary: VocabularyDraft,
    pub usages: StageUsages,
}

pub struct StoryOrchestrator {
    ai: Arc<dyn ChatClient>,
    recorder: Arc<FailureRecorder>,
}

impl StoryOrchestrator {
    pub fn new(ai: Arc<dyn ChatClient>, recorder: Arc<FailureRecorder>) -> Self {
        Self { ai, recorder }
    }

    /// Run the full text pipeline. `attempt` is the worker's 1-indexed
    /// attempt number, carried into failure context.
    pub async fn run(&self, request: &StoryRequest, attempt: i32) -> Result<PipelineOutput> {
        let mut usages = StageUsages::default();

        tracing::info!(story_ref = %request.story_id, "Text pipeline starting");

        let story = {
            let messages = prompts::story_prompt(
                &request.theme,
                request.tone.as_deref(),
                request.age_range.as_deref(),
            );
            let outcome = self
                .stage(request, attempt, "story", messages, STORY_TEMPERATURE)
                .await?;
            usages.story = outcome.1;
            outcome.0
        };
        let story = self
            .check(request, attempt, "story", assemble_story(&story))
            .await?;

        let translation = {
            let messages = prompts::translation_prompt(&story);
            let outcome = self
                .stage(request, attempt, "translation", messages, TRANSLATION_TEMPERATURE)
                .await?;
            usages.translation = outcome.1;
            outcome.0
        };
        let translation = self
            .check(request, attempt, "translation", assemble_translation(&translation))
            .await?;

        let vocabulary = {
            let messages = prompts::vocabulary_prompt(&story, &translation);
            let outcome = self
                .stage(request, attempt, "vocabulary", messages, VOCABULARY_TEMPERATURE)
                .await?;
            usages.vocabulary = outcome.1;
            outcome.0
        };
        let vocabulary = self
            .check(request, attempt, "vocabulary", assemble_vocabulary(&vocabulary))
            .await?;

        tracing::info!(
            story_ref = %request.story_id,
            total_tokens = usages.total_tokens(),
            "Text pipeline complete"
        );

        Ok(PipelineOutput { story, translation, vocabulary, usages })
    }

    /// One provider call; errors are recorded with stage context and
    /// re-raised unchanged
    async fn stage(
        &self,
        request: &StoryRequest,
        attempt: i32,
        stage: &str,
        messages: Vec<crate::ai::ChatMessage>,
        temperature: f32,
    ) -> Result<(serde_json::Value, TokenUsage)> {
        let params = ChatParams { messages, temperature, json_output: true };

        match self.ai.create_chat_completion(params).await {
            Ok(outcome) => Ok((outcome.data, outcome.usage)),
            Err(e) => {
                self.surface(request, attempt, stage, &e).await;
                Err(e)
            }
        }
    }

    /// Validation gate with the same record-then-re-raise behavior
    async fn check<T>(
        &self,
        request: &StoryRequest,
        attempt: i32,
        stage: &str,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.surface(request, attempt, stage, &e).await;
                Err(e)
            }
        }
    }

    async fn surface(&self, request: &StoryRequest, attempt: i32, stage: &str, error: &crate::Error) {
        let context = FailureContext::new(stage)
            .with_story_ref(request.story_id.clone())
            .with_attempt(attempt);

        if let Err(record_error) = self.recorder.record(&context, error).await {
            // Never mask the stage error with a bookkeeping error.
            tracing::error!("Could not record stage failure: {}", record_error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ScriptedChatClient, ScriptedResponse};
    use crate::assemble::{
        sample_story_payload, sample_translation_payload, sample_vocabulary_payload,
    };
    use crate::config::NotificationConfig;
    use crate::repository::InMemoryJobStore;

    fn request() -> StoryRequest {
        StoryRequest {
            story_id: "test-story-1".to_string(),
            theme: "friendly cloud".to_string(),
            tone: Some("warm".to_string()),
            age_range: Some("0-6".to_string()),
        }
    }

    fn orchestrator(
        responses: Vec<ScriptedResponse>,
    ) -> (StoryOrchestrator, Arc<ScriptedChatClient>, Arc<InMemoryJobStore>) {
        let ai = Arc::new(ScriptedChatClient::new(responses));
        let store = Arc::new(InMemoryJobStore::new());
        let recorder =
            Arc::new(FailureRecorder::new(store.clone(), NotificationConfig::default()));

        (StoryOrchestrator::new(ai.clone(), recorder), ai, store)
    }

    #[tokio::test]
    async fn test_full_text_pipeline() {
        let (orchestrator, ai, store) = orchestrator(vec![
            ScriptedResponse::Data(sample_story_payload(10)),
            ScriptedResponse::Data(sample_translation_payload(10)),
            ScriptedResponse::Data(sample_vocabulary_payload(10)),
        ]);

        let output = orchestrator.run(&request(), 1).await.unwrap();

        assert_eq!(output.story.pages.len(), 10);
        assert_eq!(output.translation.pages.len(), 10);
        assert_eq!(output.vocabulary.entries.len(), 10);

        assert!(output.usages.story.total_tokens > 0);
        assert!(output.usages.translation.total_tokens > 0);
        assert!(output.usages.vocabulary.total_tokens > 0);

        assert_eq!(ai.call_count(), 3);
        assert!(store.failures().await.is_empty());
    }

    #[tokio::test]
    async fn test_short_story_fails_validation_and_is_recorded() {
        let (orchestrator, ai, store) =
            orchestrator(vec![ScriptedResponse::Data(sample_story_payload(9))]);

        let err = orchestrator.run(&request(), 1).await.unwrap_err();
        assert_eq!(err.category(), "validation");

        // Only the script stage ran; the failure carries its stage name.
        assert_eq!(ai.call_count(), 1);
        let failures = store.failures().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error_message.contains("stage=story"));
    }

    #[tokio::test]
    async fn test_provider_error_recorded_and_reraised() {
        let (orchestrator, _ai, store) =
            orchestrator(vec![ScriptedResponse::Status(500)]);

        let err = orchestrator.run(&request(), 2).await.unwrap_err();
        assert_eq!(err.provider_status(), Some(500));

        let failures = store.failures().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error_message.contains("attempt=2"));
    }

    #[tokio::test]
    async fn test_translation_failure_stops_pipeline() {
        let (orchestrator, ai, _store) = orchestrator(vec![
            ScriptedResponse::Data(sample_story_payload(10)),
            ScriptedResponse::Status(502),
        ]);

        assert!(orchestrator.run(&request(), 1).await.is_err());
        // The vocabulary stage never ran.
        assert_eq!(ai.call_count(), 2);
    }
}
