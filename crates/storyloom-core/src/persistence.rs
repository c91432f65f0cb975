//! Persistence coordinator
//!
//! The sole writer of story, page, vocab and downstream media-job rows,
//! always within one database transaction. Queue pushes happen only after
//! commit: a push failure leaves the jobs safely pending for the
//! reconciler, it never rolls back committed work.

use std::sync::Arc;
use uuid::Uuid;

use crate::assemble::{StoryDraft, TranslationDraft, VocabularyDraft};
use crate::failures::{FailureContext, FailureRecorder};
use crate::models::{JobType, MediaJobSeed, NewStory, NewStoryPage, NewVocabEntry, StoryBundle};
use crate::orchestrator::{PipelineOutput, StoryRequest};
use crate::queue::{Envelope, JobQueue, QueueKind};
use crate::Result;

pub struct PersistenceCoordinator {
    store: Arc<dyn crate::repository::JobStore>,
    queue: Arc<dyn JobQueue>,
    recorder: Arc<FailureRecorder>,
    skip_persistence: bool,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn crate::repository::JobStore>,
        queue: Arc<dyn JobQueue>,
        recorder: Arc<FailureRecorder>,
        skip_persistence: bool,
    ) -> Self {
        Self { store, queue, recorder, skip_persistence }
    }

    /// Commit one story's text-pipeline output and enqueue its media jobs.
    /// Returns the created media job ids (synthetic ids in dev
    /// short-circuit mode).
    pub async fn persist(
        &self,
        request: &StoryRequest,
        output: &PipelineOutput,
    ) -> Result<Vec<String>> {
        if self.skip_persistence {
            let ids = synthetic_job_ids(&request.story_id, output.story.pages.len());
            tracing::info!(
                story_ref = %request.story_id,
                count = ids.len(),
                "SKIP_PERSISTENCE set, returning synthetic media job ids"
            );
            return Ok(ids);
        }

        let (story_id, original_ref) = canonical_story_id(&request.story_id);
        let bundle = build_bundle(story_id, original_ref, request, output);

        let job_ids = match self.store.persist_story_bundle(&bundle).await {
            Ok(ids) => ids,
            Err(e) => {
                let context = FailureContext::new("persistence")
                    .with_story_ref(request.story_id.clone())
                    .with_attempt(1);
                if let Err(record_error) = self.recorder.record(&context, &e).await {
                    tracing::error!("Could not record persistence failure: {}", record_error);
                }
                return Err(e);
            }
        };

        tracing::info!(
            story_id = %story_id,
            media_jobs = job_ids.len(),
            "Story bundle committed"
        );

        self.enqueue(request, &job_ids).await;

        Ok(job_ids.iter().map(|id| id.to_string()).collect())
    }

    /// Best-effort post-commit push. Failures are recorded, not raised:
    /// the jobs are persisted and an operator (or the reconciler) can
    /// re-enqueue them.
    async fn enqueue(&self, request: &StoryRequest, job_ids: &[Uuid]) {
        let envelopes: Vec<Envelope> = job_ids.iter().map(|id| Envelope::new(*id)).collect();

        let mut pushed = 0usize;
        let outcome = if self.queue.kind() == QueueKind::RestPush {
            // The REST endpoint takes the whole batch in one request.
            let result = self.queue.push_many(&envelopes).await;
            if result.is_ok() {
                pushed = envelopes.len();
            }
            result
        } else {
            let mut result = Ok(());
            for envelope in &envelopes {
                match self.queue.push(envelope).await {
                    Ok(()) => pushed += 1,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            result
        };

        match outcome {
            Ok(()) => {
                tracing::info!(count = pushed, "Media job references enqueued");
            }
            Err(e) => {
                tracing::warn!("Queue push failed after commit: {}", e);
                let context = FailureContext::new("upstash_push")
                    .with_story_ref(request.story_id.clone())
                    .with_attempt(1)
                    .with_extra(serde_json::json!({ "pushedJobCount": pushed }));
                if let Err(record_error) = self.recorder.record(&context, &e).await {
                    tracing::error!("Could not record push failure: {}", record_error);
                }
            }
        }
    }
}

/// Canonical story id: reuse a valid UUID reference, otherwise mint one and
/// keep the original in metadata
fn canonical_story_id(story_ref: &str) -> (Uuid, Option<String>) {
    match Uuid::parse_str(story_ref) {
        Ok(id) => (id, None),
        Err(_) => (Uuid::new_v4(), Some(story_ref.to_string())),
    }
}

fn build_bundle(
    story_id: Uuid,
    original_ref: Option<String>,
    request: &StoryRequest,
    output: &PipelineOutput,
) -> StoryBundle {
    let story = build_story(story_id, original_ref, request, output);
    let pages = build_pages(&output.story, &output.translation);
    let vocab = build_vocab(&output.vocabulary);
    let media_seeds = build_media_seeds(story_id, &pages);

    StoryBundle { story, pages, vocab, media_seeds }
}

fn build_story(
    story_id: Uuid,
    original_ref: Option<String>,
    request: &StoryRequest,
    output: &PipelineOutput,
) -> NewStory {
    // Translated title defaults to the English title when the model left
    // it blank.
    let title_zh = if output.translation.title_zh.trim().is_empty() {
        output.story.title_en.clone()
    } else {
        output.translation.title_zh.clone()
    };

    let mut metadata = serde_json::json!({
        "synopsisEn": output.story.synopsis_en,
        "synopsisZh": output.translation.synopsis_zh,
        "tokenUsage": output.usages,
    });
    if let Some(original) = original_ref {
        metadata["originalStoryId"] = serde_json::json!(original);
    }

    NewStory {
        id: story_id,
        title_en: output.story.title_en.clone(),
        title_zh: Some(title_zh),
        theme: Some(request.theme.clone()),
        age_range: request.age_range.clone(),
        metadata,
    }
}

fn build_pages(story: &StoryDraft, translation: &TranslationDraft) -> Vec<NewStoryPage> {
    story
        .pages
        .iter()
        .map(|page| NewStoryPage {
            page_number: page.page_number,
            text_en: page.text_en.clone(),
            text_zh: translation.text_for_page(page.page_number).map(str::to_string),
            word_count: crate::models::word_count(&page.text_en),
        })
        .collect()
}

fn build_vocab(vocabulary: &VocabularyDraft) -> Vec<NewVocabEntry> {
    vocabulary
        .entries
        .iter()
        .map(|entry| NewVocabEntry {
            word: entry.word.clone(),
            part_of_speech: entry.part_of_speech.clone(),
            definition_en: entry.definition_en.clone(),
            definition_zh: entry.definition_zh.clone(),
            example_en: entry.example_sentence.clone(),
            example_zh: entry.example_translation.clone(),
            cefr_level: entry.cefr_level.clone(),
        })
        .collect()
}

/// One image job and one audio job per page, in page order, image first
fn build_media_seeds(story_id: Uuid, pages: &[NewStoryPage]) -> Vec<MediaJobSeed> {
    let mut seeds = Vec::with_capacity(pages.len() * 2);

    for page in pages {
        seeds.push(MediaJobSeed {
            job_type: JobType::Image,
            page_number: page.page_number,
            payload: serde_json::json!({
                "type": "image",
                "storyId": story_id,
                "pageNumber": page.page_number,
                "textEn": page.text_en,
            }),
        });
        seeds.push(MediaJobSeed {
            job_type: JobType::Audio,
            page_number: page.page_number,
            payload: serde_json::json!({
                "type": "audio",
                "storyId": story_id,
                "pageNumber": page.page_number,
                "textEn": page.text_en,
                "textZh": page.text_zh,
            }),
        });
    }

    seeds
}

/// Dev short-circuit ids: `{storyRef}-{image|audio}-{pageNumber}` in page
/// order, image before audio
fn synthetic_job_ids(story_ref: &str, page_count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(page_count * 2);
    for page_number in 1..=page_count {
        ids.push(format!("{}-image-{}", story_ref, page_number));
        ids.push(format!("{}-audio-{}", story_ref, page_number));
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::TokenUsage;
    use crate::assemble::{
        StoryPageDraft, TranslationPageDraft, VocabEntryDraft,
    };
    use crate::config::NotificationConfig;
    use crate::orchestrator::StageUsages;
    use crate::queue::RecordingQueue;
    use crate::repository::InMemoryJobStore;

    fn output_with_pages(count: usize) -> PipelineOutput {
        let pages = (1..=count as i32)
            .map(|n| StoryPageDraft {
                page_number: n,
                text_en: format!("The cloud drifted on page {}.", n),
                summary_en: format!("Cloud scene {}.", n),
            })
            .collect();

        let translated = (1..=count as i32)
            .map(|n| TranslationPageDraft {
                page_number: n,
                text_zh: format!("云在第{}页飘过。", n),
                notes_zh: String::new(),
            })
            .collect();

        let entries = (0..10)
            .map(|n| VocabEntryDraft {
                word: format!("word{}", n),
                part_of_speech: "noun".to_string(),
                definition_en: "a thing".to_string(),
                definition_zh: "东西".to_string(),
                example_sentence: "Here is a thing.".to_string(),
                example_translation: "这里有个东西。".to_string(),
                cefr_level: Some("A1".to_string()),
            })
            .collect();

        PipelineOutput {
            story: StoryDraft {
                title_en: "The Friendly Cloud".to_string(),
                synopsis_en: "A cloud shares rain.".to_string(),
                pages,
            },
            translation: TranslationDraft {
                title_zh: "友好的云".to_string(),
                synopsis_zh: "云分享雨水。".to_string(),
                pages: translated,
            },
            vocabulary: VocabularyDraft { entries },
            usages: StageUsages {
                story: TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 },
                ..StageUsages::default()
            },
        }
    }

    fn request(story_id: &str) -> StoryRequest {
        StoryRequest {
            story_id: story_id.to_string(),
            theme: "friendly cloud".to_string(),
            tone: None,
            age_range: Some("0-6".to_string()),
        }
    }

    fn coordinator(
        store: Arc<InMemoryJobStore>,
        queue: Arc<RecordingQueue>,
        skip: bool,
    ) -> PersistenceCoordinator {
        let recorder =
            Arc::new(FailureRecorder::new(store.clone(), NotificationConfig::default()));
        PersistenceCoordinator::new(store, queue, recorder, skip)
    }

    #[tokio::test]
    async fn test_skip_persistence_returns_synthetic_ids() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(RecordingQueue::new());
        let coordinator = coordinator(store.clone(), queue.clone(), true);

        let ids =
            coordinator.persist(&request("story-ref"), &output_with_pages(10)).await.unwrap();

        assert_eq!(ids.len(), 20);
        assert_eq!(ids[0], "story-ref-image-1");
        assert_eq!(ids[1], "story-ref-audio-1");
        assert_eq!(ids[18], "story-ref-image-10");
        assert_eq!(ids[19], "story-ref-audio-10");

        // No I/O happened.
        assert_eq!(store.story_count().await, 0);
        assert_eq!(queue.push_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_and_enqueue() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(RecordingQueue::new());
        let coordinator = coordinator(store.clone(), queue.clone(), false);

        let ids = coordinator
            .persist(&request("11111111-2222-3333-4444-555555555555"), &output_with_pages(2))
            .await
            .unwrap();

        assert_eq!(ids.len(), 4);
        assert_eq!(queue.push_calls.load(std::sync::atomic::Ordering::SeqCst), 4);

        // Every message parses to a full envelope.
        for envelope in queue.pushed.lock().await.iter() {
            let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
            assert!(decoded.timestamp > 0);
            assert!(ids.contains(&decoded.job_id.to_string()));
        }

        let story_id = Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        let story = store.story(story_id).await.unwrap();
        assert_eq!(story.title_zh.as_deref(), Some("友好的云"));
        assert!(story.metadata.get("originalStoryId").is_none());

        let pages = store.pages_of(story_id).await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].word_count, 6);
        assert_eq!(pages[0].text_zh.as_deref(), Some("云在第1页飘过。"));

        assert_eq!(store.vocab_of(story_id).await.len(), 10);

        // Media jobs carry page payloads and resolved page ids.
        let image_jobs = store.jobs_of_type(JobType::Image).await;
        assert_eq!(image_jobs.len(), 2);
        assert_eq!(image_jobs[0].payload["pageNumber"], 1);
        assert!(image_jobs[0].payload.get("pageId").is_some());

        let audio_jobs = store.jobs_of_type(JobType::Audio).await;
        assert_eq!(audio_jobs.len(), 2);
        assert!(audio_jobs[0].payload["textZh"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_non_uuid_ref_is_canonicalized() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(RecordingQueue::new());
        let coordinator = coordinator(store.clone(), queue, false);

        coordinator.persist(&request("test-story-1"), &output_with_pages(1)).await.unwrap();

        let jobs = store.jobs_of_type(JobType::Image).await;
        let story_id = jobs[0].story_id.unwrap();
        let story = store.story(story_id).await.unwrap();

        assert_eq!(story.metadata["originalStoryId"], "test-story-1");
    }

    #[tokio::test]
    async fn test_insert_failure_rolls_back_and_records() {
        let store = Arc::new(InMemoryJobStore::failing_bundle_after_pages(1));
        let queue = Arc::new(RecordingQueue::new());
        let coordinator = coordinator(store.clone(), queue.clone(), false);

        let result = coordinator.persist(&request("story-x"), &output_with_pages(2)).await;
        assert!(result.is_err());

        // Nothing committed, nothing pushed, one persistence failure row.
        assert_eq!(store.story_count().await, 0);
        assert_eq!(queue.push_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let failures = store.failures().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error_message.contains("stage=persistence"));
    }

    #[tokio::test]
    async fn test_push_failure_keeps_committed_work() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(RecordingQueue::failing());
        let coordinator = coordinator(store.clone(), queue, false);

        let ids = coordinator.persist(&request("story-y"), &output_with_pages(1)).await.unwrap();
        assert_eq!(ids.len(), 2);

        // Jobs stay pending for the reconciler; the failure is on record.
        let image_jobs = store.jobs_of_type(JobType::Image).await;
        assert_eq!(image_jobs[0].status, crate::models::JobStatus::Pending);

        let failures = store.failures().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error_message.contains("stage=upstash_push"));
        assert!(failures[0].error_message.contains("pushedJobCount"));
    }
}
