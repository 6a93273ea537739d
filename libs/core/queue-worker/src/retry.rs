//! Retry scheduling and the morgue.
//!
//! This middleware wraps handler dispatch. On a job failure it mutates the
//! record (failure bookkeeping), writes it into the `retry` sorted set with
//! an exponential-backoff score or moves it to the `dead` set when retries
//! are exhausted, and re-raises the original error so outer entries still
//! observe the failure. Writing happens before re-raising, so a scheduled
//! retry survives process death.
//!
//! A Redis error during the bookkeeping write replaces the job failure and
//! escapes the chain: the processor treats it as involuntary death.

use crate::error::WorkerError;
use crate::job::{now_epoch, Job};
use crate::metrics;
use crate::middleware::{JobContext, Next, ServerMiddleware};
use crate::redis::{DEAD_SET, RETRY_SET};
use async_trait::async_trait;
use rand::RngExt;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, warn};

/// The dead set keeps at most this many jobs.
pub const DEAD_MAX_JOBS: i64 = 10_000;

/// The dead set keeps jobs at most this long (six months).
pub const DEAD_TIMEOUT_SECS: f64 = 6.0 * 30.0 * 24.0 * 3600.0;

/// Source of the random component in the backoff formula. Injectable so
/// backoff is deterministic under test.
pub trait Jitter: Send + Sync {
    /// Uniform integer in `[0, bound)`.
    fn take(&self, bound: u32) -> u32;
}

/// Thread-local RNG jitter, the production source.
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn take(&self, bound: u32) -> u32 {
        rand::rng().random_range(0..bound)
    }
}

/// Jitter fixed to one value, for deterministic tests.
pub struct FixedJitter(pub u32);

impl Jitter for FixedJitter {
    fn take(&self, _bound: u32) -> u32 {
        self.0
    }
}

/// Seconds until the next attempt for a job that has failed `count + 1`
/// times: `count⁴ + 15 + rand(30) × (count + 1)`.
pub fn delay_for(count: u32, jitter: &dyn Jitter) -> u64 {
    u64::from(count).pow(4) + 15 + u64::from(jitter.take(30)) * (u64::from(count) + 1)
}

/// Chain entry implementing retry scheduling and the morgue.
pub struct RetryMiddleware {
    redis: ConnectionManager,
    jitter: Arc<dyn Jitter>,
}

impl RetryMiddleware {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_jitter(redis, Arc::new(ThreadRngJitter))
    }

    pub fn with_jitter(redis: ConnectionManager, jitter: Arc<dyn Jitter>) -> Self {
        Self { redis, jitter }
    }

    /// Apply failure bookkeeping and write the job into `retry` or `dead`.
    ///
    /// The caller re-raises the original error afterwards; only Redis
    /// failures surface from here.
    async fn record_failure(&self, job: &mut Job, err: &WorkerError) -> Result<(), WorkerError> {
        let max = job.max_retries();
        if max == 0 {
            return Ok(());
        }

        let now = now_epoch();
        job.error_message = Some(err.job_error_message());
        job.error_class = Some(err.job_error_class().to_string());

        let count = match job.retry_count {
            None => {
                job.failed_at = Some(now);
                job.retry_count = Some(0);
                0
            }
            Some(prev) => {
                let count = prev + 1;
                job.retried_at = Some(now);
                job.retry_count = Some(count);
                count
            }
        };

        let limit = job.backtrace_limit();
        if limit > 0 && !err.frames().is_empty() {
            job.error_backtrace = Some(err.frames().iter().take(limit).cloned().collect());
        }

        if count < max {
            self.schedule_retry(job, count, now).await
        } else {
            self.retries_exhausted(job).await
        }
    }

    async fn schedule_retry(&self, job: &Job, count: u32, now: f64) -> Result<(), WorkerError> {
        let delay = delay_for(count, self.jitter.as_ref());
        let retry_at = now + delay as f64;
        let payload = job.encode()?;

        let mut conn = self.redis.clone();
        let _: () = redis::cmd("ZADD")
            .arg(RETRY_SET)
            .arg(format!("{:.6}", retry_at))
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        metrics::record_retry(job.queue());
        debug!(
            jid = %job.jid,
            retry_count = %count,
            delay_secs = %delay,
            "Scheduled job retry"
        );
        Ok(())
    }

    async fn retries_exhausted(&self, job: &Job) -> Result<(), WorkerError> {
        if job.dead == Some(false) {
            debug!(jid = %job.jid, "Retries exhausted, morgue suppressed");
            return Ok(());
        }

        warn!(
            jid = %job.jid,
            class = %job.klass,
            retry_count = ?job.retry_count,
            "Retries exhausted, sending job to the dead set"
        );
        self.send_to_morgue(job).await
    }

    /// Add the payload to the dead set and prune it by age and size, all in
    /// one transaction.
    async fn send_to_morgue(&self, job: &Job) -> Result<(), WorkerError> {
        let now = now_epoch();
        let payload = job.encode()?;
        let cutoff = now - DEAD_TIMEOUT_SECS;

        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(DEAD_SET)
            .arg(format!("{:.6}", now))
            .arg(&payload)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(DEAD_SET)
            .arg("-inf")
            .arg(format!("({:.6}", cutoff))
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(DEAD_SET)
            .arg(0)
            .arg(-DEAD_MAX_JOBS)
            .ignore()
            .query_async(&mut conn)
            .await?;

        metrics::record_dead(job.queue());
        Ok(())
    }
}

#[async_trait]
impl ServerMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn call(
        &self,
        job: &mut Job,
        ctx: &JobContext,
        next: Next<'_>,
    ) -> Result<(), WorkerError> {
        match next.run(job, ctx).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_job_failure() => {
                self.record_failure(job, &err).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
