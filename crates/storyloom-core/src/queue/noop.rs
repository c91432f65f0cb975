//! No-op queue for unconfigured environments
//!
//! Lets the service boot without side-effects: push is an error, pop waits
//! out the timeout and returns nothing so the worker loop keeps its pacing.

use async_trait::async_trait;
use std::time::Duration;

use crate::queue::{Envelope, JobQueue, QueueKind};
use crate::{Error, Result};

pub struct NoopQueue;

#[async_trait]
impl JobQueue for NoopQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Noop
    }

    async fn push(&self, _envelope: &Envelope) -> Result<()> {
        Err(Error::queue("no queue configured"))
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Envelope>> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }
}
