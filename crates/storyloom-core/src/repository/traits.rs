use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    FailedJob, GenerationJob, JobType, MediaAsset, NewFailure, NewMediaAsset, StoryBundle,
};
use crate::Result;

/// Durable CRUD over jobs, stories, pages, vocab, assets and failure rows,
/// with atomic state transitions.
///
/// `claim_job` is the sole concurrency primitive for worker coordination:
/// implementations must perform a conditional update returning the row,
/// never a read-then-write, so at most one worker observes the claim.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one pending job and return its id
    async fn create_job(
        &self,
        story_id: Option<Uuid>,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Uuid>;

    /// Atomically transition a pending job to processing. Returns `None`
    /// when the job does not exist or is not pending.
    async fn claim_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>>;

    /// Set status=completed and store the result pointer
    async fn complete_job(&self, job_id: Uuid, result_uri: &str) -> Result<()>;

    /// Set status=failed and record the reason (truncated to 512 chars)
    async fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<()>;

    /// Monotonic retry counter; returns the count after the increment
    async fn increment_retry(&self, job_id: Uuid) -> Result<i32>;

    /// One ACID transaction: insert the story, all pages, all vocab entries
    /// and one pending job per media seed. Returns the created media job
    /// ids. Any insert failure rolls back the entire bundle.
    async fn persist_story_bundle(&self, bundle: &StoryBundle) -> Result<Vec<Uuid>>;

    /// Idempotent on `generating_job_id`: a second insert with the same key
    /// returns the surviving row without writing a duplicate
    async fn insert_asset_if_absent(&self, asset: &NewMediaAsset) -> Result<MediaAsset>;

    /// Write one failure-table row
    async fn record_failure(&self, failure: &NewFailure) -> Result<FailedJob>;

    /// Unresolved failure rows, newest first (operator surface)
    async fn unresolved_failures(&self, limit: i64) -> Result<Vec<FailedJob>>;

    /// Pending jobs older than the threshold, for the reconciler
    async fn stale_pending_jobs(&self, older_than_secs: i64, limit: i64) -> Result<Vec<Uuid>>;
}
