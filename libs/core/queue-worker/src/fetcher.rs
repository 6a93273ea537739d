//! Fetching payloads from Redis queues.
//!
//! One blocking pop (BRPOP) spans every configured queue in priority order:
//! Redis serves the first non-empty key, so higher-priority queues drain
//! first and a single round trip covers them all. The shutdown flag is
//! sampled at the poll boundary; a payload that was already popped is always
//! surfaced so the processor can finish or requeue it, never dropped.

use crate::error::WorkerError;
use crate::redis::queue_key;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A payload popped from a queue, together with where it came from.
///
/// The pop already removed it from Redis, so whoever holds a `UnitOfWork`
/// owns the only copy; [`UnitOfWork::requeue`] puts it back when the holder
/// cannot finish it.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    /// Queue name (without the `queue:` key prefix).
    pub queue: String,
    /// Raw JSON payload.
    pub payload: String,
}

impl UnitOfWork {
    /// Push the payload back onto its queue.
    pub async fn requeue(&self, redis: &ConnectionManager) -> Result<(), WorkerError> {
        let mut conn = redis.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(queue_key(&self.queue))
            .arg(&self.payload)
            .query_async(&mut conn)
            .await?;

        debug!(queue = %self.queue, "Requeued in-flight payload");
        Ok(())
    }
}

/// Blocking fetcher over an ordered list of queues.
pub struct BasicFetch {
    redis: ConnectionManager,
    keys: Vec<String>,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl BasicFetch {
    pub fn new(
        redis: ConnectionManager,
        queues: &[String],
        timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            redis,
            keys: queues.iter().map(|q| queue_key(q)).collect(),
            timeout,
            shutdown,
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Pop the next available payload, blocking up to the configured
    /// timeout. Returns `None` on an idle timeout and, once shutdown has
    /// been requested, immediately at the next poll boundary.
    pub async fn fetch(&self) -> Result<Option<UnitOfWork>, WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let mut conn = self.redis.clone();
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.keys)
            .arg(self.timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|(key, payload)| UnitOfWork {
            queue: key.strip_prefix("queue:").unwrap_or(&key).to_string(),
            payload,
        }))
    }
}
