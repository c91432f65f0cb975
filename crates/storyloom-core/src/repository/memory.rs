//! In-memory job store
//!
//! Backs the test suite and database-less development environments. All
//! state lives behind one async mutex, so `claim_job` keeps the same
//! exactly-once claim semantics as the conditional UPDATE in the Postgres
//! implementation.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    FailedJob, GenerationJob, JobStatus, JobType, MediaAsset, NewFailure, NewMediaAsset, Story,
    StoryBundle, StoryPage, StoryStatus, VocabEntry,
};
use crate::repository::traits::JobStore;
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, GenerationJob>,
    stories: HashMap<Uuid, Story>,
    pages: Vec<StoryPage>,
    vocab: Vec<VocabEntry>,
    assets: HashMap<Uuid, MediaAsset>,
    failures: Vec<FailedJob>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    /// When set, the bundle transaction fails atomically after this many
    /// page inserts (rollback testing)
    fail_bundle_after_pages: Option<usize>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `persist_story_bundle` fail mid-way; nothing from the
    /// bundle becomes visible
    pub fn failing_bundle_after_pages(pages: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), fail_bundle_after_pages: Some(pages) }
    }

    pub async fn job(&self, id: Uuid) -> Option<GenerationJob> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    pub async fn jobs_of_type(&self, job_type: JobType) -> Vec<GenerationJob> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<_> =
            inner.jobs.values().filter(|j| j.job_type == job_type).cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn story(&self, id: Uuid) -> Option<Story> {
        self.inner.lock().await.stories.get(&id).cloned()
    }

    pub async fn pages_of(&self, story_id: Uuid) -> Vec<StoryPage> {
        let inner = self.inner.lock().await;
        let mut pages: Vec<_> =
            inner.pages.iter().filter(|p| p.story_id == story_id).cloned().collect();
        pages.sort_by_key(|p| p.page_number);
        pages
    }

    pub async fn vocab_of(&self, story_id: Uuid) -> Vec<VocabEntry> {
        let inner = self.inner.lock().await;
        inner.vocab.iter().filter(|v| v.story_id == story_id).cloned().collect()
    }

    pub async fn asset_count(&self) -> usize {
        self.inner.lock().await.assets.len()
    }

    pub async fn failures(&self) -> Vec<FailedJob> {
        self.inner.lock().await.failures.clone()
    }

    pub async fn story_count(&self) -> usize {
        self.inner.lock().await.stories.len()
    }

    /// Operator-style requeue: put a failed job back to pending
    pub async fn reset_pending(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Pending;
            job.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        story_id: Option<Uuid>,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now();

        inner.jobs.insert(
            id,
            GenerationJob {
                id,
                story_id,
                job_type,
                status: JobStatus::Pending,
                retry_count: 0,
                payload,
                result_uri: None,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(id)
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        let mut inner = self.inner.lock().await;

        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn complete_job(&self, job_id: Uuid, result_uri: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;

        job.status = JobStatus::Completed;
        job.result_uri = Some(result_uri.to_string());
        job.updated_at = Utc::now();

        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;

        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.chars().take(512).collect());
        job.updated_at = Utc::now();

        Ok(())
    }

    async fn increment_retry(&self, job_id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;

        job.retry_count += 1;
        job.updated_at = Utc::now();

        Ok(job.retry_count)
    }

    async fn persist_story_bundle(&self, bundle: &StoryBundle) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // Staged writes: nothing lands in `inner` until every insert has
        // succeeded, mirroring the Postgres transaction.
        let story = Story {
            id: bundle.story.id,
            title_en: bundle.story.title_en.clone(),
            title_zh: bundle.story.title_zh.clone(),
            theme: bundle.story.theme.clone(),
            status: StoryStatus::Processing,
            age_range: bundle.story.age_range.clone(),
            metadata: bundle.story.metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        let mut pages = Vec::new();
        let mut page_ids: HashMap<i32, Uuid> = HashMap::new();

        for (idx, page) in bundle.pages.iter().enumerate() {
            if self.fail_bundle_after_pages == Some(idx) {
                return Err(Error::Other("simulated insert failure".to_string()));
            }

            let page_id = Uuid::new_v4();
            page_ids.insert(page.page_number, page_id);
            pages.push(StoryPage {
                id: page_id,
                story_id: bundle.story.id,
                page_number: page.page_number,
                text_en: page.text_en.clone(),
                text_zh: page.text_zh.clone(),
                word_count: page.word_count,
                image_asset_id: None,
                audio_asset_id: None,
                created_at: now,
            });
        }

        let vocab: Vec<VocabEntry> = bundle
            .vocab
            .iter()
            .map(|entry| VocabEntry {
                id: Uuid::new_v4(),
                story_id: bundle.story.id,
                word: entry.word.clone(),
                part_of_speech: entry.part_of_speech.clone(),
                definition_en: entry.definition_en.clone(),
                definition_zh: entry.definition_zh.clone(),
                example_en: entry.example_en.clone(),
                example_zh: entry.example_zh.clone(),
                cefr_level: entry.cefr_level.clone(),
                created_at: now,
            })
            .collect();

        let mut job_ids = Vec::with_capacity(bundle.media_seeds.len());
        let mut jobs = Vec::new();

        for seed in &bundle.media_seeds {
            let mut payload = seed.payload.clone();
            if let (Some(map), Some(page_id)) =
                (payload.as_object_mut(), page_ids.get(&seed.page_number))
            {
                map.insert("pageId".to_string(), serde_json::json!(page_id));
            }

            let job_id = Uuid::new_v4();
            job_ids.push(job_id);
            jobs.push(GenerationJob {
                id: job_id,
                story_id: Some(bundle.story.id),
                job_type: seed.job_type,
                status: JobStatus::Pending,
                retry_count: 0,
                payload,
                result_uri: None,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            });
        }

        inner.stories.insert(story.id, story);
        inner.pages.extend(pages);
        inner.vocab.extend(vocab);
        for job in jobs {
            inner.jobs.insert(job.id, job);
        }

        Ok(job_ids)
    }

    async fn insert_asset_if_absent(&self, asset: &NewMediaAsset) -> Result<MediaAsset> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.assets.get(&asset.generating_job_id) {
            return Ok(existing.clone());
        }

        let row = MediaAsset {
            id: Uuid::new_v4(),
            story_id: asset.story_id,
            page_id: asset.page_id,
            kind: asset.kind,
            uri: asset.uri.clone(),
            format: asset.format.clone(),
            duration_secs: asset.duration_secs,
            metadata: asset.metadata.clone(),
            generating_job_id: asset.generating_job_id,
            created_at: Utc::now(),
        };

        inner.assets.insert(asset.generating_job_id, row.clone());
        Ok(row)
    }

    async fn record_failure(&self, failure: &NewFailure) -> Result<FailedJob> {
        let mut inner = self.inner.lock().await;

        let row = FailedJob {
            id: Uuid::new_v4(),
            job_id: failure.job_id,
            error_code: failure.error_code.clone(),
            error_message: failure.error_message.clone(),
            resolved: false,
            created_at: Utc::now(),
        };

        inner.failures.push(row.clone());
        Ok(row)
    }

    async fn unresolved_failures(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner.failures.iter().filter(|f| !f.resolved).cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn stale_pending_jobs(&self, older_than_secs: i64, limit: i64) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs);

        let mut stale: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.updated_at < cutoff)
            .collect();
        stale.sort_by_key(|j| j.created_at);

        Ok(stale.iter().take(limit as usize).map(|j| j.id).collect())
    }
}
