//! Queue Worker - Redis-Backed Background Job Processing
//!
//! A framework for running background jobs against the Redis list/sorted-set
//! queue convention:
//! - JSON job payloads on `queue:<name>` lists (LPUSH to enqueue, BRPOP to
//!   fetch), prioritized fetch across multiple queues
//! - Middleware chain composed around every execution (logging, retry,
//!   handler dispatch by default; user entries welcome)
//! - Exponential-backoff retries in the `retry` sorted set, exhausted jobs
//!   in a size- and age-capped `dead` set
//! - A supervised processor pool: crashed processors are replaced until
//!   shutdown is requested, running jobs always complete
//! - Graceful shutdown via one atomic flag sampled at fetch boundaries
//! - Health endpoints and Prometheus metrics in the house style
//!
//! # Architecture
//!
//! ```text
//! Client ──LPUSH──▶ queue:<name> (Redis list)
//!                      │ BRPOP
//!                      ▼
//!              Server ── supervises ──▶ Processor × N
//!                                          │ invoke
//!                                          ▼
//!                     logger → retry → dispatch → JobHandler
//!                                │ on failure
//!                                ▼
//!                     retry (zset, backoff score) ──▶ dead (zset, capped)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use queue_worker::{
//!     Client, HandlerRegistry, Job, JobContext, JobHandler, RedisPool,
//!     Server, ServerConfig, WorkerError,
//! };
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl JobHandler for EmailHandler {
//!     async fn perform(&self, job: &Job, _ctx: &JobContext) -> Result<(), WorkerError> {
//!         let (to, subject): (String, String) = job.decode_args()?;
//!         send_email(&to, &subject).await
//!     }
//! }
//!
//! let pool = RedisPool::connect(&config).await?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("EmailHandler", Arc::new(EmailHandler));
//!
//! let server = Arc::new(Server::new(pool, registry, ServerConfig::default()));
//! server.run().await?;
//! ```

mod client;
mod error;
mod fetcher;
pub mod health;
mod job;
pub mod metrics;
mod middleware;
mod processor;
pub mod redis;
mod registry;
mod retry;
mod server;

// Re-export all public types
pub use client::Client;
pub use error::WorkerError;
pub use fetcher::{BasicFetch, UnitOfWork};
pub use health::{health_router, HealthState};
pub use job::{
    now_epoch, BacktracePolicy, Job, RetryPolicy, DEFAULT_BACKTRACE_LIMIT, DEFAULT_MAX_RETRIES,
    DEFAULT_QUEUE,
};
pub use middleware::{
    JobContext, LoggerMiddleware, MiddlewareChain, Next, NoopTerminal, ServerMiddleware, Terminal,
};
pub use processor::Processor;
pub use redis::RedisPool;
pub use registry::{DispatchMiddleware, HandlerRegistry, JobHandler};
pub use retry::{
    delay_for, FixedJitter, Jitter, RetryMiddleware, ThreadRngJitter, DEAD_MAX_JOBS,
    DEAD_TIMEOUT_SECS,
};
pub use server::{Server, ServerConfig};

/// Result type alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
