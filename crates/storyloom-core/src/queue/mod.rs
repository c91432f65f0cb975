//! Queue adapter
//!
//! Decouples request admission from execution. Three variants are chosen
//! once at startup: a direct list broker (preferred), a REST push fallback,
//! and a no-op that lets the service boot without side-effects. The
//! envelope is intentionally minimal; all truth is in the job store.

pub mod noop;
pub mod redis;
pub mod rest;

pub use noop::NoopQueue;
pub use redis::RedisListQueue;
pub use rest::RestPushQueue;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::Result;

/// The minimal JSON blob placed on the queue, one line per message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub job_id: Uuid,
    /// Epoch milliseconds at push time
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(job_id: Uuid) -> Self {
        Self { job_id, timestamp: Utc::now().timestamp_millis() }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Which adapter variant a queue instance is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    ListBroker,
    RestPush,
    Noop,
}

/// Push/pop of job references over the configured broker
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn push(&self, envelope: &Envelope) -> Result<()>;

    /// Push a batch. The default loops `push`; the REST variant overrides
    /// this to send all messages in a single request.
    async fn push_many(&self, envelopes: &[Envelope]) -> Result<()> {
        for envelope in envelopes {
            self.push(envelope).await?;
        }
        Ok(())
    }

    /// Blocking pop with bounded timeout; `None` on timeout
    async fn pop(&self, timeout: Duration) -> Result<Option<Envelope>>;
}

/// Static adapter selection, resolved once from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChoice {
    ListBroker { url: String },
    RestPush { url: String, token: String },
    Noop,
}

impl QueueChoice {
    /// Precedence: list-broker URL, then REST url+token, then no-op
    pub fn from_config(config: &QueueConfig) -> Self {
        if let Some(url) = &config.redis_url {
            return QueueChoice::ListBroker { url: url.clone() };
        }

        if let (Some(url), Some(token)) = (&config.rest_url, &config.rest_token) {
            return QueueChoice::RestPush { url: url.clone(), token: token.clone() };
        }

        QueueChoice::Noop
    }
}

/// Build the queue adapter for the process lifetime
pub async fn connect(config: &QueueConfig) -> Result<Arc<dyn JobQueue>> {
    match QueueChoice::from_config(config) {
        QueueChoice::ListBroker { url } => {
            let queue = RedisListQueue::connect(&url, &config.queue_name).await?;
            tracing::info!(queue = %config.queue_name, "Queue adapter: list broker");
            Ok(Arc::new(queue))
        }
        QueueChoice::RestPush { url, token } => {
            tracing::info!(queue = %config.queue_name, "Queue adapter: REST push fallback");
            Ok(Arc::new(RestPushQueue::new(url, token, config.queue_name.clone())))
        }
        QueueChoice::Noop => {
            tracing::warn!("No queue configured, using no-op adapter");
            Ok(Arc::new(NoopQueue))
        }
    }
}

/// Recording queue for tests: counts pushes and serves queued envelopes
#[cfg(test)]
pub struct RecordingQueue {
    pub pushed: tokio::sync::Mutex<Vec<Envelope>>,
    pub push_calls: std::sync::atomic::AtomicUsize,
    pub pending: tokio::sync::Mutex<std::collections::VecDeque<Envelope>>,
    pub fail_pushes: bool,
}

#[cfg(test)]
impl RecordingQueue {
    pub fn new() -> Self {
        Self {
            pushed: tokio::sync::Mutex::new(Vec::new()),
            push_calls: std::sync::atomic::AtomicUsize::new(0),
            pending: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            fail_pushes: false,
        }
    }

    pub fn failing() -> Self {
        Self { fail_pushes: true, ..Self::new() }
    }

    pub async fn enqueue_for_pop(&self, envelope: Envelope) {
        self.pending.lock().await.push_back(envelope);
    }
}

#[cfg(test)]
#[async_trait]
impl JobQueue for RecordingQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::ListBroker
    }

    async fn push(&self, envelope: &Envelope) -> Result<()> {
        self.push_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_pushes {
            return Err(crate::Error::queue("simulated push failure"));
        }
        self.pushed.lock().await.push(envelope.clone());
        Ok(())
    }

    async fn pop(&self, _timeout: Duration) -> Result<Option<Envelope>> {
        Ok(self.pending.lock().await.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new(Uuid::new_v4());
        let encoded = envelope.encode().unwrap();

        // Single line, both fields present
        assert!(!encoded.contains('\n'));
        assert!(encoded.contains("jobId"));
        assert!(encoded.contains("timestamp"));

        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_selection_prefers_list_broker() {
        let config = QueueConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            rest_url: Some("https://broker.example.com".to_string()),
            rest_token: Some("token".to_string()),
            queue_name: "generation_jobs".to_string(),
        };

        assert_eq!(
            QueueChoice::from_config(&config),
            QueueChoice::ListBroker { url: "redis://localhost:6379".to_string() }
        );
    }

    #[test]
    fn test_selection_rest_fallback() {
        let config = QueueConfig {
            redis_url: None,
            rest_url: Some("https://broker.example.com".to_string()),
            rest_token: Some("token".to_string()),
            queue_name: "generation_jobs".to_string(),
        };

        assert_eq!(
            QueueChoice::from_config(&config),
            QueueChoice::RestPush {
                url: "https://broker.example.com".to_string(),
                token: "token".to_string(),
            }
        );
    }

    #[test]
    fn test_selection_noop_when_unconfigured() {
        let config = QueueConfig::default();
        assert_eq!(QueueChoice::from_config(&config), QueueChoice::Noop);
    }
}
