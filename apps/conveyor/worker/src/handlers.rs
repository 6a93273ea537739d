//! Handlers this service executes.
//!
//! Domain crates plug their handlers in here; the service ships with the
//! operational ones.

use async_trait::async_trait;
use queue_worker::{HandlerRegistry, Job, JobContext, JobHandler, WorkerError};
use std::sync::Arc;
use tracing::info;

/// Build the registry of every handler this worker serves.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("Ping", Arc::new(PingHandler));
    registry
}

/// End-to-end smoke check: enqueue `{"klass":"Ping","args":["hello"]}` and
/// watch the log line come out the other side.
struct PingHandler;

#[async_trait]
impl JobHandler for PingHandler {
    async fn perform(&self, job: &Job, ctx: &JobContext) -> Result<(), WorkerError> {
        let (message,): (String,) = job.decode_args()?;
        info!(jid = %job.jid, queue = %ctx.queue, message = %message, "pong");
        Ok(())
    }
}
