//! REST push fallback queue
//!
//! For deployments where the broker is only reachable over its HTTP API.
//! Push-only: the worker must run next to the real list broker. Some broker
//! gateways reject the `{queue, messages}` body and want a raw
//! Redis-command body instead; when the first attempt comes back with a
//! command-parse complaint the push is retried once in that shape.

use async_trait::async_trait;
use std::time::Duration;

use crate::queue::{Envelope, JobQueue, QueueKind};
use crate::{Error, Result};

pub struct RestPushQueue {
    client: reqwest::Client,
    url: String,
    token: String,
    queue_name: String,
}

impl RestPushQueue {
    pub fn new(url: String, token: String, queue_name: String) -> Self {
        Self { client: reqwest::Client::new(), url, token, queue_name }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(u16, String)> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        Ok((status, text))
    }

    fn message_body(&self, messages: &[String]) -> serde_json::Value {
        serde_json::json!({
            "queue": self.queue_name,
            "messages": messages,
        })
    }

    fn command_body(&self, messages: &[String]) -> serde_json::Value {
        let mut command = vec![
            serde_json::json!("RPUSH"),
            serde_json::json!(self.queue_name),
        ];
        command.extend(messages.iter().map(|m| serde_json::json!(m)));

        serde_json::json!({ "command": command })
    }
}

/// Whether a first-attempt response means the endpoint wants a
/// Redis-command-style body. Status 0 stands for a transport failure with
/// no HTTP status at all.
pub(crate) fn needs_command_retry(status: u16, body: &str) -> bool {
    if matches!(status, 400 | 422 | 0) {
        return true;
    }

    let lowered = body.to_lowercase();
    lowered.contains("failed to parse") || lowered.contains("parse error")
}

#[async_trait]
impl JobQueue for RestPushQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::RestPush
    }

    async fn push(&self, envelope: &Envelope) -> Result<()> {
        self.push_many(std::slice::from_ref(envelope)).await
    }

    async fn push_many(&self, envelopes: &[Envelope]) -> Result<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let messages: Vec<String> =
            envelopes.iter().map(|e| e.encode()).collect::<Result<_>>()?;

        let (status, body) = match self.post(&self.message_body(&messages)).await {
            Ok(outcome) => outcome,
            // Transport failure: same retry path as a parse complaint.
            Err(e) => {
                tracing::warn!("REST queue push transport failure: {}", e);
                (0, String::new())
            }
        };

        if matches!(status, 401 | 403) {
            return Err(Error::queue(format!("REST queue auth rejected ({})", status)));
        }

        if (200..300).contains(&status) && !needs_command_retry(status, &body) {
            tracing::debug!(count = envelopes.len(), "Pushed job references via REST");
            return Ok(());
        }

        if !needs_command_retry(status, &body) {
            return Err(Error::queue(format!("REST queue push failed ({}): {}", status, body)));
        }

        tracing::warn!(
            status,
            "REST queue rejected message body, retrying with command body"
        );

        let (status, body) = self.post(&self.command_body(&messages)).await?;
        if (200..300).contains(&status) {
            tracing::debug!(count = envelopes.len(), "Pushed job references via command body");
            Ok(())
        } else {
            Err(Error::queue(format!(
                "REST queue command push failed ({}): {}",
                status, body
            )))
        }
    }

    async fn pop(&self, _timeout: Duration) -> Result<Option<Envelope>> {
        Err(Error::queue("REST push queue does not support pop"))
    }
}
