//! Enqueueing jobs.
//!
//! The data-layer counterpart of the worker: normalizes a job record,
//! runs the client middleware chain, and lands the payload on its queue
//! (`SADD queues` + `LPUSH queue:<name>`). The innermost continuation of
//! the client chain is the Redis push itself, so client middleware can
//! mutate the record or veto the push by returning an error.

use crate::error::WorkerError;
use crate::job::{now_epoch, Job};
use crate::middleware::{JobContext, MiddlewareChain, ServerMiddleware, Terminal};
use crate::redis::{queue_key, QUEUES_SET};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Producer handle. Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct Client {
    redis: ConnectionManager,
    chain: MiddlewareChain,
}

/// Terminal of the client chain: the actual Redis write.
struct PushTerminal {
    redis: ConnectionManager,
}

#[async_trait]
impl Terminal for PushTerminal {
    async fn execute(&self, job: &mut Job, _ctx: &JobContext) -> Result<(), WorkerError> {
        let queue = job.queue().to_string();
        let payload = job.encode()?;

        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .cmd("SADD")
            .arg(QUEUES_SET)
            .arg(&queue)
            .ignore()
            .cmd("LPUSH")
            .arg(queue_key(&queue))
            .arg(&payload)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(jid = %job.jid, queue = %queue, "Enqueued job");
        Ok(())
    }
}

impl Client {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            chain: MiddlewareChain::new(),
        }
    }

    /// Add a client middleware entry wrapping every push.
    pub fn with_middleware(mut self, entry: Arc<dyn ServerMiddleware>) -> Self {
        self.chain.add(entry);
        self
    }

    /// The client middleware chain.
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Enqueue one job; returns its jid.
    pub async fn push(&self, job: Job) -> Result<String, WorkerError> {
        let mut job = normalize(job);
        let jid = job.jid.clone();
        let ctx = JobContext::new(job.queue().to_string(), "client");

        let terminal = PushTerminal {
            redis: self.redis.clone(),
        };
        self.chain.invoke(&mut job, &ctx, &terminal).await?;

        Ok(jid)
    }

    /// Enqueue many jobs of the same shape in one pipeline; returns their
    /// jids. Client middleware runs per job before anything is written.
    pub async fn push_bulk(&self, jobs: Vec<Job>) -> Result<Vec<String>, WorkerError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        // Run the chain per job with a buffering terminal, then flush the
        // collected payloads in a single round trip.
        let buffer = BufferTerminal::default();
        let mut jids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let mut job = normalize(job);
            jids.push(job.jid.clone());
            let ctx = JobContext::new(job.queue().to_string(), "client");
            self.chain.invoke(&mut job, &ctx, &buffer).await?;
        }

        let staged = buffer.staged.into_inner().unwrap();
        let mut pipe = redis::pipe();
        for (queue, payload) in &staged {
            pipe.cmd("SADD").arg(QUEUES_SET).arg(queue).ignore();
            pipe.cmd("LPUSH").arg(queue_key(queue)).arg(payload).ignore();
        }

        let mut conn = self.redis.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(count = %jids.len(), "Enqueued job batch");
        Ok(jids)
    }
}

/// Terminal that stages (queue, payload) pairs instead of writing them.
#[derive(Default)]
struct BufferTerminal {
    staged: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Terminal for BufferTerminal {
    async fn execute(&self, job: &mut Job, _ctx: &JobContext) -> Result<(), WorkerError> {
        let queue = job.queue().to_string();
        let payload = job.encode()?;
        self.staged.lock().unwrap().push((queue, payload));
        Ok(())
    }
}

/// Fill in what every enqueued payload carries: a jid, an explicit queue,
/// and creation/enqueue timestamps.
fn normalize(mut job: Job) -> Job {
    if job.jid.is_empty() {
        job.jid = Uuid::new_v4().simple().to_string();
    }
    if job.queue.is_none() {
        job.queue = Some(crate::job::DEFAULT_QUEUE.to_string());
    }

    let now = Value::from(now_epoch());
    job.extra.entry("created_at").or_insert_with(|| now.clone());
    job.extra.entry("enqueued_at").or_insert(now);
    job
}
