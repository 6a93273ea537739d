//! Middleware chain composed around job execution.
//!
//! Entries wrap the rest of the chain: each receives the job, the execution
//! context, and a [`Next`] continuation owning the tail of the chain plus
//! the terminal. An entry observes (and re-raises) anything the inner
//! entries or the terminal return, which is how the retry middleware sees
//! handler failures and the logger sees everything.
//!
//! The chain is owned by the server, mutable between construction and
//! `run`, and shared read-only across processors afterwards.

use crate::error::WorkerError;
use crate::job::Job;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Execution context for one job attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Queue the payload was popped from (or is being pushed to).
    pub queue: String,
    /// Identity of the executing processor, for log correlation.
    pub processor: String,
}

impl JobContext {
    pub fn new(queue: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            processor: processor.into(),
        }
    }
}

/// The innermost continuation of a chain invocation.
///
/// The server runs its handler dispatch as a chain entry, so its terminal
/// is a no-op; the client's terminal performs the actual Redis push.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn execute(&self, job: &mut Job, ctx: &JobContext) -> Result<(), WorkerError>;
}

/// Terminal that does nothing. Used by the server, where the last chain
/// entry performs handler dispatch.
pub struct NoopTerminal;

#[async_trait]
impl Terminal for NoopTerminal {
    async fn execute(&self, _job: &mut Job, _ctx: &JobContext) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// A single middleware entry.
#[async_trait]
pub trait ServerMiddleware: Send + Sync {
    /// Name used for ordering operations (`remove`, `insert_before`).
    fn name(&self) -> &str;

    /// Run this entry around the rest of the chain. Implementations decide
    /// whether and when to await `next.run(..)` and may inspect or re-raise
    /// its error.
    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), WorkerError>;
}

/// Continuation capturing the tail of the chain plus the terminal.
pub struct Next<'a> {
    entries: &'a [Arc<dyn ServerMiddleware>],
    terminal: &'a dyn Terminal,
}

impl Next<'_> {
    /// Run the rest of the chain, then the terminal.
    pub async fn run(self, job: &mut Job, ctx: &JobContext) -> Result<(), WorkerError> {
        match self.entries.split_first() {
            Some((head, tail)) => {
                head.call(
                    job,
                    ctx,
                    Next {
                        entries: tail,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.execute(job, ctx).await,
        }
    }
}

/// Ordered collection of middleware entries.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn ServerMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry to the end of the chain.
    pub fn add(&mut self, entry: Arc<dyn ServerMiddleware>) {
        self.entries.push(entry);
    }

    /// Insert an entry at the front of the chain.
    pub fn prepend(&mut self, entry: Arc<dyn ServerMiddleware>) {
        self.entries.insert(0, entry);
    }

    /// Insert an entry just before the named one. Appends when the name is
    /// not present.
    pub fn insert_before(&mut self, name: &str, entry: Arc<dyn ServerMiddleware>) {
        match self.entries.iter().position(|e| e.name() == name) {
            Some(pos) => self.entries.insert(pos, entry),
            None => self.entries.push(entry),
        }
    }

    /// Remove every entry matching the predicate; returns how many went.
    pub fn remove_if(&mut self, predicate: impl Fn(&dyn ServerMiddleware) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(e.as_ref()));
        before - self.entries.len()
    }

    /// Remove the named entry, if present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.remove_if(|e| e.name() == name) > 0
    }

    /// The entries in invocation order.
    pub fn entries(&self) -> &[Arc<dyn ServerMiddleware>] {
        &self.entries
    }

    /// Compose all entries around `terminal` and run them.
    pub async fn invoke(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        terminal: &dyn Terminal,
    ) -> Result<(), WorkerError> {
        Next {
            entries: &self.entries,
            terminal,
        }
        .run(job, ctx)
        .await
    }
}

/// Logging entry: one structured event when a job starts, one when it
/// finishes or fails, with elapsed time. Sits first in the default chain so
/// it observes the error after retry bookkeeping re-raised it.
#[derive(Default)]
pub struct LoggerMiddleware;

impl LoggerMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerMiddleware for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), WorkerError> {
        info!(
            jid = %job.jid,
            class = %job.klass,
            queue = %ctx.queue,
            processor = %ctx.processor,
            "Job started"
        );

        let start = Instant::now();
        match next.run(job, ctx).await {
            Ok(()) => {
                info!(
                    jid = %job.jid,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "Job done"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    jid = %job.jid,
                    class = %job.klass,
                    error = %e,
                    elapsed_ms = %start.elapsed().as_millis(),
                    "Job failed"
                );
                Err(e)
            }
        }
    }
}
