use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Story lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "story_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    Scheduled,
    Processing,
    Published,
    Failed,
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryStatus::Draft => write!(f, "draft"),
            StoryStatus::Scheduled => write!(f, "scheduled"),
            StoryStatus::Processing => write!(f, "processing"),
            StoryStatus::Published => write!(f, "published"),
            StoryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Generation job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,

    /// Claimed by exactly one worker
    Processing,

    /// Finished with a result pointer
    Completed,

    /// Finished with a failure reason
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Check if job is terminal (won't change without operator action)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Generation job type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    StoryScript,
    Translation,
    Vocabulary,
    Image,
    Audio,
    Video,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::StoryScript => write!(f, "story_script"),
            JobType::Translation => write!(f, "translation"),
            JobType::Vocabulary => write!(f, "vocabulary"),
            JobType::Image => write!(f, "image"),
            JobType::Audio => write!(f, "audio"),
            JobType::Video => write!(f, "video"),
        }
    }
}

/// Produced artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "media_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Story aggregate root
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Story {
    pub id: Uuid,
    pub title_en: String,
    pub title_zh: Option<String>,
    pub theme: Option<String>,
    pub status: StoryStatus,
    pub age_range: Option<String>,
    /// Free-form map: synopses, non-canonical original id, anything the
    /// pipeline wants the admin UI to see
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a story; exactly 10 per story, numbered 1..10
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoryPage {
    pub id: Uuid,
    pub story_id: Uuid,
    pub page_number: i32,
    pub text_en: String,
    pub text_zh: Option<String>,
    /// Derived at insert time by whitespace tokenization of the English text
    pub word_count: i32,
    pub image_asset_id: Option<Uuid>,
    pub audio_asset_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Vocabulary entry; exactly 10 per story
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VocabEntry {
    pub id: Uuid,
    pub story_id: Uuid,
    pub word: String,
    pub part_of_speech: String,
    pub definition_en: String,
    pub definition_zh: String,
    pub example_en: String,
    pub example_zh: String,
    pub cefr_level: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The unit of asynchronous work
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationJob {
    pub id: Uuid,
    /// Null for story_script jobs created before their story row exists
    pub story_id: Option<Uuid>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub retry_count: i32,
    pub payload: serde_json::Value,
    pub result_uri: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A produced media artifact
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MediaAsset {
    pub id: Uuid,
    pub story_id: Uuid,
    pub page_id: Option<Uuid>,
    pub kind: MediaKind,
    pub uri: String,
    pub format: Option<String>,
    pub duration_secs: Option<f64>,
    pub metadata: serde_json::Value,
    /// Unique: insertion is idempotent on this key
    pub generating_job_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Audit row written when a job exhausts its retry budget or a coordination
/// step fails outside a job context
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedJob {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub error_code: String,
    pub error_message: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert record for a story row
#[derive(Debug, Clone)]
pub struct NewStory {
    pub id: Uuid,
    pub title_en: String,
    pub title_zh: Option<String>,
    pub theme: Option<String>,
    pub age_range: Option<String>,
    pub metadata: serde_json::Value,
}

/// Insert record for a page row
#[derive(Debug, Clone)]
pub struct NewStoryPage {
    pub page_number: i32,
    pub text_en: String,
    pub text_zh: Option<String>,
    pub word_count: i32,
}

/// Insert record for a vocabulary row
#[derive(Debug, Clone)]
pub struct NewVocabEntry {
    pub word: String,
    pub part_of_speech: String,
    pub definition_en: String,
    pub definition_zh: String,
    pub example_en: String,
    pub example_zh: String,
    pub cefr_level: Option<String>,
}

/// Seed for one downstream media job, created inside the bundle transaction
#[derive(Debug, Clone)]
pub struct MediaJobSeed {
    pub job_type: JobType,
    pub page_number: i32,
    pub payload: serde_json::Value,
}

/// Everything the persistence coordinator commits in one transaction
#[derive(Debug, Clone)]
pub struct StoryBundle {
    pub story: NewStory,
    pub pages: Vec<NewStoryPage>,
    pub vocab: Vec<NewVocabEntry>,
    pub media_seeds: Vec<MediaJobSeed>,
}

/// Insert record for a media asset
#[derive(Debug, Clone)]
pub struct NewMediaAsset {
    pub story_id: Uuid,
    pub page_id: Option<Uuid>,
    pub kind: MediaKind,
    pub uri: String,
    pub format: Option<String>,
    pub duration_secs: Option<f64>,
    pub metadata: serde_json::Value,
    pub generating_job_id: Uuid,
}

/// Insert record for a failure-table row
#[derive(Debug, Clone)]
pub struct NewFailure {
    pub job_id: Option<Uuid>,
    pub error_code: String,
    pub error_message: String,
}

/// Count words the way page rows store them
pub fn word_count(text: &str) -> i32 {
    text.split_whitespace().count() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_job_type_display() {
        assert_eq!(JobType::StoryScript.to_string(), "story_script");
        assert_eq!(JobType::Audio.to_string(), "audio");
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("The little cloud drifted home"), 5);
        assert_eq!(word_count("  spaced   out   "), 2);
        assert_eq!(word_count(""), 0);
    }
}
