//! Direct list-broker queue over Redis
//!
//! RPUSH to enqueue, BRPOP with a bounded timeout to dequeue. The
//! connection manager reconnects on its own; a failed command surfaces as a
//! queue error and the caller decides whether to retry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::queue::{Envelope, JobQueue, QueueKind};
use crate::Result;

pub struct RedisListQueue {
    manager: ConnectionManager,
    queue_name: String,
}

impl RedisListQueue {
    /// Open the client and validate the connection with a PING
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(crate::Error::queue("Redis PING failed"));
        }

        tracing::info!(queue = %queue_name, "Redis list broker connected");

        Ok(Self { manager, queue_name: queue_name.to_string() })
    }
}

#[async_trait]
impl JobQueue for RedisListQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::ListBroker
    }

    async fn push(&self, envelope: &Envelope) -> Result<()> {
        let body = envelope.encode()?;
        let mut conn = self.manager.clone();

        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.queue_name)
            .arg(&body)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(job_id = %envelope.job_id, "Pushed job reference");
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Envelope>> {
        let mut conn = self.manager.clone();

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.queue_name)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((_list, raw)) => Ok(Some(Envelope::decode(&raw)?)),
            None => Ok(None),
        }
    }
}
