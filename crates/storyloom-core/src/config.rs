use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for storyloom
///
/// Resolved from environment variables at startup. Every knob has a default
/// so a process can boot in a development environment with nothing but an
/// AI key set (or `SKIP_ENV_VALIDATION` for tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Dev short-circuit: the persistence coordinator returns synthetic job
    /// ids and performs no I/O
    #[serde(default)]
    pub skip_persistence: bool,

    /// Bypass startup key checks (test only)
    #[serde(default)]
    pub skip_env_validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai: AiConfig::default(),
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            media: MediaConfig::default(),
            notifications: NotificationConfig::default(),
            skip_persistence: false,
            skip_env_validation: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let config = Self {
            ai: AiConfig {
                api_key: env_string("OPENAI_API_KEY").unwrap_or_default(),
                base_url: env_string("OPENAI_BASE_URL")
                    .unwrap_or_else(default_ai_base_url),
                model: env_string("OPENAI_MODEL").unwrap_or_else(default_ai_model),
                max_retries: env_parse("AI_MAX_RETRIES").unwrap_or(3),
                backoff_base_ms: env_parse("AI_BACKOFF_BASE_MS").unwrap_or(1000),
                request_timeout_secs: env_parse("AI_TIMEOUT_SECS").unwrap_or(120),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL").or_else(|| env_string("POSTGRES_URL")),
                pool_size: env_parse("DATABASE_POOL_SIZE").unwrap_or(5),
            },
            queue: QueueConfig {
                redis_url: env_string("UPSTASH_REDIS_URL"),
                rest_url: env_string("UPSTASH_REST_URL"),
                rest_token: env_string("UPSTASH_REST_TOKEN"),
                queue_name: env_string("UPSTASH_QUEUE_NAME")
                    .unwrap_or_else(default_queue_name),
            },
            worker: WorkerConfig {
                concurrency: env_parse("WORKER_CONCURRENCY").unwrap_or(3),
                poll_interval_ms: env_parse("WORKER_POLL_INTERVAL_MS").unwrap_or(5000),
                max_retries: env_parse("WORKER_MAX_RETRIES").unwrap_or(3),
                backoff_base_ms: env_parse("WORKER_BACKOFF_BASE_MS").unwrap_or(1000),
                shutdown_grace_secs: env_parse("WORKER_SHUTDOWN_GRACE_SECS").unwrap_or(30),
                reconcile_interval_secs: env_parse("RECONCILE_INTERVAL_SECS").unwrap_or(60),
                reconcile_stale_after_secs: env_parse("RECONCILE_STALE_AFTER_SECS")
                    .unwrap_or(300),
            },
            media: MediaConfig {
                image_api_key: env_string("IMAGE_API_KEY"),
                tts_api_key: env_string("TTS_API_KEY"),
                upload_dir: env_string("UPLOAD_DIR").unwrap_or_else(default_upload_dir),
                public_base_url: env_string("MEDIA_BASE_URL")
                    .unwrap_or_else(default_media_base_url),
                video_fps: env_parse("VIDEO_FPS").unwrap_or(24),
            },
            notifications: NotificationConfig {
                slack_webhook: env_string("SLACK_WEBHOOK"),
                enabled: env_parse("FAILURE_NOTIFICATIONS").unwrap_or(true),
            },
            skip_persistence: env_flag("SKIP_PERSISTENCE"),
            skip_env_validation: env_flag("SKIP_ENV_VALIDATION"),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.skip_env_validation && self.ai.api_key.is_empty() {
            return Err(Error::Config(
                "OPENAI_API_KEY is required (set SKIP_ENV_VALIDATION to bypass in tests)"
                    .to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(Error::Config("Worker concurrency must be > 0".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(Error::Config("Database pool size must be > 0".to_string()));
        }

        if self.queue.rest_url.is_some() != self.queue.rest_token.is_some() {
            return Err(Error::Config(
                "UPSTASH_REST_URL and UPSTASH_REST_TOKEN must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

/// Generative-text provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_ai_base_url")]
    pub base_url: String,

    #[serde(default = "default_ai_model")]
    pub model: String,

    /// In-call retry ceiling for transient provider errors
    #[serde(default = "default_ai_retries")]
    pub max_retries: u32,

    /// Base for exponential backoff between provider retries
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_ai_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_ai_base_url(),
            model: default_ai_model(),
            max_retries: default_ai_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_secs: default_ai_timeout(),
        }
    }
}

impl AiConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// Relational store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string (`DATABASE_URL`, falling back to `POSTGRES_URL`)
    pub url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Queue broker settings
///
/// Selection precedence: list-broker URL, then REST url+token, then no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    pub redis_url: Option<String>,
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

/// Worker loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max concurrent job handlers per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle-poll delay, also the blocking-pop timeout
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retry ceiling before a job failure becomes permanent
    #[serde(default = "default_worker_retries")]
    pub max_retries: i32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// How long shutdown waits for in-flight handlers
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// A pending job older than this with no worker activity is re-pushed
    #[serde(default = "default_reconcile_stale")]
    pub reconcile_stale_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_worker_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            shutdown_grace_secs: default_shutdown_grace(),
            reconcile_interval_secs: default_reconcile_interval(),
            reconcile_stale_after_secs: default_reconcile_stale(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Media provider and blob storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub image_api_key: Option<String>,
    pub tts_api_key: Option<String>,

    /// Local blob fallback directory
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Prefix for URIs returned by the local blob store
    #[serde(default = "default_media_base_url")]
    pub public_base_url: String,

    #[serde(default = "default_video_fps")]
    pub video_fps: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            image_api_key: None,
            tts_api_key: None,
            upload_dir: default_upload_dir(),
            public_base_url: default_media_base_url(),
            video_fps: default_video_fps(),
        }
    }
}

/// Failure notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub slack_webhook: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { slack_webhook: None, enabled: true }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_retries() -> u32 {
    3
}

fn default_ai_timeout() -> u64 {
    120
}

fn default_pool_size() -> u32 {
    5
}

fn default_queue_name() -> String {
    "generation_jobs".to_string()
}

fn default_concurrency() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_worker_retries() -> i32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_stale() -> u64 {
    300
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_media_base_url() -> String {
    "local://media".to_string()
}

fn default_video_fps() -> u32 {
    24
}

fn default_true() -> bool {
    true
}
