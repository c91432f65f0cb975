//! Worker
//!
//! Polls the queue, atomically claims jobs, routes them to stage handlers,
//! and records completion or failure. The poll loop is single-threaded and
//! only dispatches; each claimed job runs in its own task up to the
//! configured concurrency cap. A job id being handled is never re-entered:
//! the in-flight set is checked before spawning and cleared by a guard when
//! the handler finishes, however it finishes.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::ai::Backoff;
use crate::config::WorkerConfig;
use crate::failures::{FailureContext, FailureRecorder};
use crate::media::{
    GeneratedMedia, ImageGenerator, LocalMediaStore, SpeechSynthesizer, VideoComposer, VideoInput,
};
use crate::models::{GenerationJob, JobType, MediaKind, NewMediaAsset};
use crate::orchestrator::{StoryOrchestrator, StoryRequest};
use crate::persistence::PersistenceCoordinator;
use crate::queue::{Envelope, JobQueue};
use crate::repository::JobStore;
use crate::{Error, Result};

/// Media handlers the worker routes to
pub struct MediaHandlers {
    pub images: ImageGenerator,
    pub speech: SpeechSynthesizer,
    pub composer: VideoComposer,
    pub store: Arc<LocalMediaStore>,
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: StoryOrchestrator,
    persistence: PersistenceCoordinator,
    recorder: Arc<FailureRecorder>,
    media: MediaHandlers,
    config: WorkerConfig,

    /// Job ids currently being handled; insertion happens only on the
    /// dispatch loop, removal via the handler's guard
    running: Mutex<HashSet<Uuid>>,

    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Clears the in-flight entry when a handler finishes
struct RunningGuard {
    worker: Arc<Worker>,
    job_id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.worker.running.lock() {
            running.remove(&self.job_id);
        }
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        orchestrator: StoryOrchestrator,
        persistence: PersistenceCoordinator,
        recorder: Arc<FailureRecorder>,
        media: MediaHandlers,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            persistence,
            recorder,
            media,
            config,
            running: Mutex::new(HashSet::new()),
            jobs_processed: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        }
    }

    /// Poll loop. Returns after a shutdown signal once in-flight handlers
    /// have drained (bounded by the configured grace period).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Worker loop starting"
        );

        let pop_backoff = Backoff::new(Duration::from_millis(self.config.backoff_base_ms));
        let mut consecutive_pop_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.in_flight() >= self.config.concurrency {
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            let popped = tokio::select! {
                _ = shutdown.changed() => break,
                popped = self.queue.pop(self.config.poll_interval()) => popped,
            };

            match popped {
                Ok(Some(envelope)) => {
                    consecutive_pop_errors = 0;
                    self.clone().dispatch(envelope);
                }
                Ok(None) => {
                    consecutive_pop_errors = 0;
                }
                Err(e) => {
                    consecutive_pop_errors += 1;
                    let delay = pop_backoff.delay_for(consecutive_pop_errors);
                    tracing::error!(
                        delay_ms = delay.as_millis() as u64,
                        "Queue pop failed: {}",
                        e
                    );
                    sleep(delay).await;
                }
            }
        }

        tracing::info!("Worker loop stopped, draining in-flight handlers");
        self.drain().await;
    }

    /// Spawn a handler for one queue message, unless the job is already
    /// being handled here
    fn dispatch(self: Arc<Self>, envelope: Envelope) {
        let job_id = envelope.job_id;

        {
            let mut running = match self.running.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !running.insert(job_id) {
                tracing::info!(job_id = %job_id, "Job already in flight, skipping duplicate message");
                return;
            }
        }

        let worker = self.clone();
        tokio::spawn(async move {
            let _guard = RunningGuard { worker: worker.clone(), job_id };

            worker.jobs_processed.fetch_add(1, Ordering::Relaxed);
            match worker.handle(job_id).await {
                Ok(()) => {
                    worker.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    worker.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(job_id = %job_id, "Job handler failed: {}", e);
                }
            }
        });
    }

    /// Claim, validate, route. Errors that escape the route are fed to the
    /// failure policy; the returned Result only reports bookkeeping
    /// problems.
    pub async fn handle(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.store.claim_job(job_id).await? else {
            // Another worker took it, or the message is stale. Not an error.
            tracing::info!(job_id = %job_id, "Claim miss");
            return Ok(());
        };

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            retry_count = job.retry_count,
            "Job claimed"
        );

        if !job.payload.is_object() {
            self.store.fail_job(job.id, "invalid_job_row_shape").await?;
            return Ok(());
        }

        let outcome = match job.job_type {
            JobType::StoryScript => self.handle_story_script(&job).await,
            JobType::Image => self.handle_image(&job).await,
            JobType::Audio => self.handle_audio(&job).await,
            JobType::Video => self.handle_video(&job).await,
            other => Err(Error::validation(format!("unknown job type: {}", other))),
        };

        match outcome {
            Ok(result_uri) => {
                self.store.complete_job(job.id, &result_uri).await?;
                tracing::info!(job_id = %job.id, result_uri = %result_uri, "Job completed");
                Ok(())
            }
            Err(e) => self.apply_failure_policy(&job, e).await,
        }
    }

    async fn handle_story_script(&self, job: &GenerationJob) -> Result<String> {
        let request: StoryRequest = serde_json::from_value(job.payload.clone())
            .map_err(|_| Error::validation("invalid_job_row_shape"))?;

        let attempt = job.retry_count + 1;
        let output = self.orchestrator.run(&request, attempt).await?;
        self.persistence.persist(&request, &output).await?;

        Ok(format!("story://{}", request.story_id))
    }

    async fn handle_image(&self, job: &GenerationJob) -> Result<String> {
        let payload: MediaJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|_| Error::validation("invalid_job_row_shape"))?;
        let story_id = job
            .story_id
            .ok_or_else(|| Error::validation("invalid_job_row_shape"))?;

        let prompt = crate::prompts::image_prompt(&payload.text_en);
        let media = self.media.images.generate(&prompt, payload.size.as_deref()).await?;

        let asset = self
            .insert_asset(job, story_id, payload.page_id, MediaKind::Image, &media)
            .await?;

        Ok(asset.uri)
    }

    async fn handle_audio(&self, job: &GenerationJob) -> Result<String> {
        let payload: MediaJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|_| Error::validation("invalid_job_row_shape"))?;
        let story_id = job
            .story_id
            .ok_or_else(|| Error::validation("invalid_job_row_shape"))?;

        // Narration uses the translated text when the pipeline produced one.
        let text = payload
            .text_zh
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&payload.text_en);

        let media = self
            .media
            .speech
            .synthesize(&story_id.to_string(), text, payload.voice.as_deref(), None)
            .await?;

        let asset = self
            .insert_asset(job, story_id, payload.page_id, MediaKind::Audio, &media)
            .await?;

        Ok(asset.uri)
    }

    async fn handle_video(&self, job: &GenerationJob) -> Result<String> {
        let input: VideoInput = serde_json::from_value(job.payload.clone())
            .map_err(|_| Error::validation("invalid_job_row_shape"))?;
        let story_id = job
            .story_id
            .ok_or_else(|| Error::validation("invalid_job_row_shape"))?;

        let workdir = std::env::temp_dir().join(format!("storyloom-video-{}", job.id));
        tokio::fs::create_dir_all(&workdir).await?;

        let composed = self.media.composer.compose(&input, &workdir).await;
        let result = match composed {
            Ok(path) => {
                let uri = self.media.store.put_file(&story_id.to_string(), &path).await?;
                let media = GeneratedMedia {
                    uri,
                    format: input.format.clone().unwrap_or_else(|| "mp4".to_string()),
                    duration_secs: input
                        .per_page_durations
                        .as_ref()
                        .map(|d| d.iter().sum()),
                    metadata: serde_json::json!({ "pages": input.image_uris.len() }),
                };
                let asset = self
                    .insert_asset(job, story_id, None, MediaKind::Video, &media)
                    .await?;
                Ok(asset.uri)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            tracing::warn!(workdir = %workdir.display(), "Could not clean video workdir: {}", e);
        }

        result
    }

    async fn insert_asset(
        &self,
        job: &GenerationJob,
        story_id: Uuid,
        page_id: Option<Uuid>,
        kind: MediaKind,
        media: &GeneratedMedia,
    ) -> Result<crate::models::MediaAsset> {
        self.store
            .insert_asset_if_absent(&NewMediaAsset {
                story_id,
                page_id,
                kind,
                uri: media.uri.clone(),
                format: Some(media.format.clone()),
                duration_secs: media.duration_secs,
                metadata: media.metadata.clone(),
                generating_job_id: job.id,
            })
            .await
    }

    /// Increment the retry counter and mark the job failed: below the
    /// ceiling with a `temporary_error:` prefix (requeueing is the
    /// reconciler's or an operator's task), at the ceiling with
    /// `permanent_error:` plus a failure-table record.
    async fn apply_failure_policy(&self, job: &GenerationJob, error: Error) -> Result<()> {
        let count = self.store.increment_retry(job.id).await?;

        if count < self.config.max_retries {
            tracing::warn!(
                job_id = %job.id,
                retry_count = count,
                "Job failed, below retry ceiling: {}",
                error
            );
            self.store
                .fail_job(job.id, &format!("temporary_error:{}", error))
                .await?;
        } else {
            tracing::error!(
                job_id = %job.id,
                retry_count = count,
                "Job permanently failed: {}",
                error
            );
            self.store
                .fail_job(job.id, &format!("permanent_error:{}", error))
                .await?;

            let context = FailureContext::new(job.job_type.to_string())
                .with_job(job.id)
                .with_attempt(count)
                .with_extra(serde_json::json!({
                    "storyId": job.story_id,
                }));
            if let Err(record_error) = self.recorder.record(&context, &error).await {
                tracing::error!("Could not record permanent failure: {}", record_error);
            }
        }

        Ok(())
    }

    /// Re-push pending jobs that have sat unclaimed past the staleness
    /// threshold. Keeps the job store authoritative after queue-push
    /// failures.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let stale = self
            .store
            .stale_pending_jobs(self.config.reconcile_stale_after_secs as i64, 100)
            .await?;

        let mut pushed = 0usize;
        for job_id in &stale {
            match self.queue.push(&Envelope::new(*job_id)).await {
                Ok(()) => pushed += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, "Reconcile push failed: {}", e);
                    break;
                }
            }
        }

        if pushed > 0 {
            tracing::info!(pushed, "Reconciler re-enqueued stale pending jobs");
        }

        Ok(pushed)
    }

    fn in_flight(&self) -> usize {
        match self.running.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Wait for in-flight handlers, bounded by the shutdown grace period
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();

        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.in_flight(),
                    "Shutdown grace expired with handlers still in flight"
                );
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        tracing::info!(
            processed = self.jobs_processed.load(Ordering::Relaxed),
            succeeded = self.jobs_succeeded.load(Ordering::Relaxed),
            failed = self.jobs_failed.load(Ordering::Relaxed),
            "Worker drained cleanly"
        );
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            in_flight: self.in_flight(),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Media-job payload as written by the persistence coordinator
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaJobPayload {
    #[serde(default)]
    #[allow(dead_code)]
    page_number: Option<i32>,
    text_en: String,
    #[serde(default)]
    text_zh: Option<String>,
    #[serde(default)]
    page_id: Option<Uuid>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    voice: Option<String>,
}

/// Worker statistics
#[derive(Debug, Clone, Copy)]
pub struct WorkerStats {
    pub in_flight: usize,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ScriptedChatClient, ScriptedResponse};
    use crate::assemble::{
        sample_story_payload, sample_translation_payload, sample_vocabulary_payload,
    };
    use crate::config::{MediaConfig, NotificationConfig};
    use crate::queue::RecordingQueue;
    use crate::repository::InMemoryJobStore;

    struct Rig {
        worker: Arc<Worker>,
        store: Arc<InMemoryJobStore>,
        queue: Arc<RecordingQueue>,
        _upload_dir: tempfile::TempDir,
    }

    fn rig(responses: Vec<ScriptedResponse>) -> Rig {
        let store: Arc<InMemoryJobStore> = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(RecordingQueue::new());
        let recorder = Arc::new(FailureRecorder::new(
            store.clone(),
            NotificationConfig::default(),
        ));

        let upload_dir = tempfile::tempdir().unwrap();
        let media_config = MediaConfig {
            upload_dir: upload_dir.path().to_string_lossy().to_string(),
            ..MediaConfig::default()
        };
        let media_store = Arc::new(LocalMediaStore::new(&media_config).unwrap());

        let ai = Arc::new(ScriptedChatClient::new(responses));
        let orchestrator = StoryOrchestrator::new(ai, recorder.clone());
        let persistence = PersistenceCoordinator::new(
            store.clone(),
            queue.clone(),
            recorder.clone(),
            false,
        );

        let media = MediaHandlers {
            images: ImageGenerator::new(None, "https://unused".to_string()),
            speech: SpeechSynthesizer::new(
                None,
                "https://unused".to_string(),
                media_store.clone(),
            ),
            composer: VideoComposer::new(24),
            store: media_store,
        };

        let worker = Arc::new(Worker::new(
            store.clone(),
            queue.clone(),
            orchestrator,
            persistence,
            recorder,
            media,
            WorkerConfig::default(),
        ));

        Rig { worker, store, queue, _upload_dir: upload_dir }
    }

    #[tokio::test]
    async fn test_claim_miss_is_not_an_error() {
        let rig = rig(vec![]);
        // No such job at all.
        assert!(rig.worker.handle(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_story_script_end_to_end() {
        let rig = rig(vec![
            ScriptedResponse::Data(sample_story_payload(10)),
            ScriptedResponse::Data(sample_translation_payload(10)),
            ScriptedResponse::Data(sample_vocabulary_payload(10)),
        ]);

        let job_id = rig
            .store
            .create_job(
                None,
                JobType::StoryScript,
                serde_json::json!({
                    "type": "story_script",
                    "storyId": "11111111-2222-3333-4444-555555555555",
                    "theme": "a friendly dragon",
                }),
            )
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();

        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Completed);
        assert_eq!(
            job.result_uri.as_deref(),
            Some("story://11111111-2222-3333-4444-555555555555")
        );

        // 10 pages -> 10 image + 10 audio jobs, all enqueued.
        assert_eq!(rig.store.jobs_of_type(JobType::Image).await.len(), 10);
        assert_eq!(rig.store.jobs_of_type(JobType::Audio).await.len(), 10);
        assert_eq!(
            rig.queue.push_calls.load(std::sync::atomic::Ordering::SeqCst),
            20
        );
    }

    #[tokio::test]
    async fn test_image_job_inserts_asset_and_completes() {
        let rig = rig(vec![]);
        let story_id = Uuid::new_v4();

        let job_id = rig
            .store
            .create_job(
                Some(story_id),
                JobType::Image,
                serde_json::json!({
                    "pageNumber": 1,
                    "textEn": "A little cloud woke up.",
                }),
            )
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();

        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Completed);
        assert!(job.result_uri.unwrap().contains("placeholder"));
        assert_eq!(rig.store.asset_count().await, 1);
    }

    #[tokio::test]
    async fn test_audio_job_prefers_translated_text() {
        let rig = rig(vec![]);
        let story_id = Uuid::new_v4();

        let job_id = rig
            .store
            .create_job(
                Some(story_id),
                JobType::Audio,
                serde_json::json!({
                    "pageNumber": 1,
                    "textEn": "A little cloud woke up.",
                    "textZh": "一朵小云醒来了。",
                }),
            )
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();

        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Completed);
        // Placeholder URI is a hash of the narrated text.
        assert_eq!(
            job.result_uri.unwrap(),
            format!(
                "https://placeholder.storyloom.dev/audio/{}.mp3",
                crate::media::content_key("一朵小云醒来了。".as_bytes())
            )
        );
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_terminally() {
        let rig = rig(vec![]);

        let job_id = rig
            .store
            .create_job(None, JobType::Translation, serde_json::json!({}))
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();

        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Failed);
        assert!(job.failure_reason.unwrap().contains("unknown job type"));
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_with_shape_error() {
        let rig = rig(vec![]);

        let job_id = rig
            .store
            .create_job(None, JobType::StoryScript, serde_json::json!("not an object"))
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();

        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.status, crate::models::JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("invalid_job_row_shape"));
    }

    #[tokio::test]
    async fn test_retry_ladder_to_permanent_failure() {
        // Three runs, each hitting a provider 400 (non-retriable in-call).
        let rig = rig(vec![
            ScriptedResponse::Status(400),
            ScriptedResponse::Status(400),
            ScriptedResponse::Status(400),
        ]);

        let job_id = rig
            .store
            .create_job(
                None,
                JobType::StoryScript,
                serde_json::json!({
                    "storyId": "story-1",
                    "theme": "a friendly dragon",
                }),
            )
            .await
            .unwrap();

        // Attempt 1 and 2: temporary failures.
        for expected_count in 1..=2 {
            rig.worker.handle(job_id).await.unwrap();
            let job = rig.store.job(job_id).await.unwrap();
            assert_eq!(job.status, crate::models::JobStatus::Failed);
            assert_eq!(job.retry_count, expected_count);
            assert!(job.failure_reason.unwrap().starts_with("temporary_error:"));
            rig.store.reset_pending(job_id).await;
        }

        // Attempt 3 hits the ceiling.
        rig.worker.handle(job_id).await.unwrap();
        let job = rig.store.job(job_id).await.unwrap();
        assert_eq!(job.retry_count, 3);
        assert!(job.failure_reason.unwrap().starts_with("permanent_error:"));

        // Orchestrator recorded each stage failure; the worker added one
        // permanent record on top.
        let failures = rig.store.failures().await;
        assert_eq!(failures.len(), 4);
        assert!(failures.last().unwrap().error_message.contains("stage=story_script"));
    }

    #[tokio::test]
    async fn test_completed_job_cannot_be_rehandled() {
        let rig = rig(vec![]);
        let story_id = Uuid::new_v4();

        let job_id = rig
            .store
            .create_job(
                Some(story_id),
                JobType::Image,
                serde_json::json!({ "pageNumber": 1, "textEn": "text" }),
            )
            .await
            .unwrap();

        rig.worker.handle(job_id).await.unwrap();
        // Stale duplicate message: claim misses, nothing changes.
        rig.worker.handle(job_id).await.unwrap();

        assert_eq!(rig.store.asset_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_repushes_stale_pending_jobs() {
        let rig = rig(vec![]);

        let config = WorkerConfig {
            reconcile_stale_after_secs: 0,
            ..WorkerConfig::default()
        };
        // Rebuild a worker with a zero staleness threshold for the test.
        let recorder = Arc::new(FailureRecorder::new(
            rig.store.clone(),
            NotificationConfig::default(),
        ));
        let ai = Arc::new(ScriptedChatClient::new(vec![]));
        let orchestrator = StoryOrchestrator::new(ai, recorder.clone());
        let persistence = PersistenceCoordinator::new(
            rig.store.clone(),
            rig.queue.clone(),
            recorder.clone(),
            false,
        );
        let upload_dir = tempfile::tempdir().unwrap();
        let media_config = MediaConfig {
            upload_dir: upload_dir.path().to_string_lossy().to_string(),
            ..MediaConfig::default()
        };
        let media_store = Arc::new(LocalMediaStore::new(&media_config).unwrap());
        let worker = Worker::new(
            rig.store.clone(),
            rig.queue.clone(),
            orchestrator,
            persistence,
            recorder,
            MediaHandlers {
                images: ImageGenerator::new(None, "https://unused".to_string()),
                speech: SpeechSynthesizer::new(
                    None,
                    "https://unused".to_string(),
                    media_store.clone(),
                ),
                composer: VideoComposer::new(24),
                store: media_store,
            },
            config,
        );

        rig.store
            .create_job(None, JobType::Image, serde_json::json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pushed = worker.reconcile_once().await.unwrap();
        assert_eq!(pushed, 1);
        assert_eq!(
            rig.queue.push_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
