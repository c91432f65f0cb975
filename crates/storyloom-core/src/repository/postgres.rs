//! PostgreSQL job store implementation

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::models::{
    FailedJob, GenerationJob, JobStatus, JobType, MediaAsset, NewFailure, NewMediaAsset,
    StoryBundle, StoryStatus,
};
use crate::repository::traits::JobStore;
use crate::Result;

/// Reasons stored on failed jobs are capped at this length
const MAX_FAILURE_REASON_LEN: usize = 512;

/// PostgreSQL database handle
#[derive(Clone)]
pub struct PostgresDb {
    pool: Pool<Postgres>,
}

impl PostgresDb {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Create PostgreSQL connection pool
pub async fn create_pool(database_url: &str, pool_size: u32) -> Result<Pool<Postgres>> {
    use sqlx::postgres::PgPoolOptions;

    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
        .map_err(crate::Error::Database)?;

    tracing::info!("PostgreSQL connected successfully");
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresJobStore {
    db: PostgresDb,
}

impl PostgresJobStore {
    pub fn new(db: PostgresDb) -> Self {
        Self { db }
    }

    async fn audit(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        action: &str,
        entity_type: &str,
        entity_id: Uuid,
        detail: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (action, entity_type, entity_id, detail) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(action)
        .bind(entity_type)
        .bind(entity_id)
        .bind(detail)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(
        &self,
        story_id: Option<Uuid>,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO generation_jobs (story_id, job_type, status, payload) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(story_id)
        .bind(job_type)
        .bind(JobStatus::Pending)
        .bind(payload)
        .fetch_one(self.db.pool())
        .await?;

        Ok(id)
    }

    async fn claim_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        // Conditional UPDATE returning the row: exactly one worker can win
        // the pending -> processing transition.
        let job = sqlx::query_as::<_, GenerationJob>(
            "UPDATE generation_jobs \
             SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = $3 \
             RETURNING *",
        )
        .bind(job_id)
        .bind(JobStatus::Processing)
        .bind(JobStatus::Pending)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>> {
        let job = sqlx::query_as::<_, GenerationJob>(
            "SELECT * FROM generation_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(job)
    }

    async fn complete_job(&self, job_id: Uuid, result_uri: &str) -> Result<()> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status = $2, result_uri = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Completed)
        .bind(result_uri)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let reason: String = reason.chars().take(MAX_FAILURE_REASON_LEN).collect();

        sqlx::query(
            "UPDATE generation_jobs \
             SET status = $2, failure_reason = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Failed)
        .bind(reason)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn increment_retry(&self, job_id: Uuid) -> Result<i32> {
        let count: i32 = sqlx::query_scalar(
            "UPDATE generation_jobs \
             SET retry_count = retry_count + 1, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING retry_count",
        )
        .bind(job_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(count)
    }

    async fn persist_story_bundle(&self, bundle: &StoryBundle) -> Result<Vec<Uuid>> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            "INSERT INTO stories (id, title_en, title_zh, theme, status, age_range, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(bundle.story.id)
        .bind(&bundle.story.title_en)
        .bind(&bundle.story.title_zh)
        .bind(&bundle.story.theme)
        .bind(StoryStatus::Processing)
        .bind(&bundle.story.age_range)
        .bind(&bundle.story.metadata)
        .execute(&mut *tx)
        .await?;

        // Page ids are needed to stamp the media-job payloads below.
        let mut page_ids: std::collections::HashMap<i32, Uuid> =
            std::collections::HashMap::new();

        for page in &bundle.pages {
            let page_id: Uuid = sqlx::query_scalar(
                "INSERT INTO story_pages (story_id, page_number, text_en, text_zh, word_count) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(bundle.story.id)
            .bind(page.page_number)
            .bind(&page.text_en)
            .bind(&page.text_zh)
            .bind(page.word_count)
            .fetch_one(&mut *tx)
            .await?;

            page_ids.insert(page.page_number, page_id);
        }

        for entry in &bundle.vocab {
            sqlx::query(
                "INSERT INTO vocab_entries \
                 (story_id, word, part_of_speech, definition_en, definition_zh, \
                  example_en, example_zh, cefr_level) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(bundle.story.id)
            .bind(&entry.word)
            .bind(&entry.part_of_speech)
            .bind(&entry.definition_en)
            .bind(&entry.definition_zh)
            .bind(&entry.example_en)
            .bind(&entry.example_zh)
            .bind(&entry.cefr_level)
            .execute(&mut *tx)
            .await?;
        }

        let mut job_ids = Vec::with_capacity(bundle.media_seeds.len());

        for seed in &bundle.media_seeds {
            let mut payload = seed.payload.clone();
            if let (Some(map), Some(page_id)) =
                (payload.as_object_mut(), page_ids.get(&seed.page_number))
            {
                map.insert("pageId".to_string(), serde_json::json!(page_id));
            }

            let job_id: Uuid = sqlx::query_scalar(
                "INSERT INTO generation_jobs (story_id, job_type, status, payload) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
            )
            .bind(bundle.story.id)
            .bind(seed.job_type)
            .bind(JobStatus::Pending)
            .bind(payload)
            .fetch_one(&mut *tx)
            .await?;

            job_ids.push(job_id);
        }

        Self::audit(
            &mut tx,
            "story_bundle_persisted",
            "story",
            bundle.story.id,
            serde_json::json!({
                "pages": bundle.pages.len(),
                "vocab": bundle.vocab.len(),
                "mediaJobs": job_ids.len(),
            }),
        )
        .await?;

        tx.commit().await?;

        Ok(job_ids)
    }

    async fn insert_asset_if_absent(&self, asset: &NewMediaAsset) -> Result<MediaAsset> {
        let inserted = sqlx::query_as::<_, MediaAsset>(
            "INSERT INTO media_assets \
             (story_id, page_id, kind, uri, format, duration_secs, metadata, generating_job_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (generating_job_id) DO NOTHING \
             RETURNING *",
        )
        .bind(asset.story_id)
        .bind(asset.page_id)
        .bind(asset.kind)
        .bind(&asset.uri)
        .bind(&asset.format)
        .bind(asset.duration_secs)
        .bind(&asset.metadata)
        .bind(asset.generating_job_id)
        .fetch_optional(self.db.pool())
        .await?;

        match inserted {
            Some(row) => Ok(row),
            None => {
                // Lost the race (or re-run): hand back the surviving row.
                let existing = sqlx::query_as::<_, MediaAsset>(
                    "SELECT * FROM media_assets WHERE generating_job_id = $1",
                )
                .bind(asset.generating_job_id)
                .fetch_one(self.db.pool())
                .await?;

                Ok(existing)
            }
        }
    }

    async fn record_failure(&self, failure: &NewFailure) -> Result<FailedJob> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query_as::<_, FailedJob>(
            "INSERT INTO failed_jobs (job_id, error_code, error_message) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(failure.job_id)
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .fetch_one(&mut *tx)
        .await?;

        Self::audit(
            &mut tx,
            "failure_recorded",
            "failed_job",
            row.id,
            serde_json::json!({ "errorCode": row.error_code }),
        )
        .await?;

        tx.commit().await?;

        Ok(row)
    }

    async fn unresolved_failures(&self, limit: i64) -> Result<Vec<FailedJob>> {
        let rows = sqlx::query_as::<_, FailedJob>(
            "SELECT * FROM failed_jobs WHERE resolved = FALSE \
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    async fn stale_pending_jobs(&self, older_than_secs: i64, limit: i64) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM generation_jobs \
             WHERE status = $1 AND updated_at < NOW() - ($2 * INTERVAL '1 second') \
             ORDER BY created_at ASC LIMIT $3",
        )
        .bind(JobStatus::Pending)
        .bind(older_than_secs)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(ids)
    }
}
