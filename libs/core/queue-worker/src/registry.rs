//! Handler registration and dispatch.
//!
//! A job names its handler by class string; the registry maps those names to
//! executable handlers. Dispatch runs as the last entry of the server
//! middleware chain, so every other entry wraps the handler call.

use crate::error::WorkerError;
use crate::job::Job;
use crate::middleware::{JobContext, Next, ServerMiddleware};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A handler that performs jobs of one class.
///
/// # Example
///
/// ```rust,ignore
/// struct EmailHandler {
///     mailer: Arc<dyn Mailer>,
/// }
///
/// #[async_trait]
/// impl JobHandler for EmailHandler {
///     async fn perform(&self, job: &Job, _ctx: &JobContext) -> Result<(), WorkerError> {
///         let (to, subject): (String, String) = job.decode_args()?;
///         self.mailer.send(&to, &subject).await
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Perform one job. Returning an error counts as a job failure and goes
    /// through retry bookkeeping.
    async fn perform(&self, job: &Job, ctx: &JobContext) -> Result<(), WorkerError>;
}

/// Class name → handler map. Built once at startup, shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a class name. A later registration for the
    /// same name replaces the earlier one.
    pub fn register(&mut self, klass: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(klass.into(), handler);
    }

    /// Look up the handler for a class name.
    pub fn resolve(&self, klass: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(klass).cloned()
    }

    pub fn contains(&self, klass: &str) -> bool {
        self.handlers.contains_key(klass)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Chain entry that resolves the job's class and runs its handler.
pub struct DispatchMiddleware {
    registry: Arc<HandlerRegistry>,
}

impl DispatchMiddleware {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ServerMiddleware for DispatchMiddleware {
    fn name(&self) -> &str {
        "dispatch"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), WorkerError> {
        let handler = self
            .registry
            .resolve(&job.klass)
            .ok_or_else(|| WorkerError::NoHandler(job.klass.clone()))?;

        handler.perform(job, ctx).await?;
        next.run(job, ctx).await
    }
}
