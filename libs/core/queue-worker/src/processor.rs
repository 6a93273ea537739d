//! The processor: one concurrent executor.
//!
//! Each processor is its own tokio task looping fetch → decode → invoke.
//! Job failures are fully absorbed inside the middleware chain, so the loop
//! only ends two ways: voluntarily once shutdown is requested (`Ok`), or
//! involuntarily on an infrastructure error (`Err`), which the supervisor
//! receives as a death notification.

use crate::error::WorkerError;
use crate::fetcher::{BasicFetch, UnitOfWork};
use crate::job::Job;
use crate::metrics::{self, JobStatus};
use crate::middleware::{JobContext, MiddlewareChain, NoopTerminal};
use crate::redis::RedisPool;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One in-process worker executing jobs sequentially.
#[derive(Clone)]
pub struct Processor {
    id: Uuid,
    label: String,
    pool: RedisPool,
    queues: Vec<String>,
    fetch_timeout: Duration,
    chain: Arc<MiddlewareChain>,
    shutdown: Arc<AtomicBool>,
}

impl Processor {
    pub fn new(
        pool: RedisPool,
        queues: &[String],
        fetch_timeout: Duration,
        chain: Arc<MiddlewareChain>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let id = Uuid::new_v4();

        Self {
            id,
            label: format!("processor-{}", &id.simple().to_string()[..8]),
            pool,
            queues: queues.to_vec(),
            fetch_timeout,
            chain,
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run until shutdown (Ok) or an infrastructure failure (Err).
    pub async fn run(&self) -> Result<(), WorkerError> {
        // Blocking pops get a connection of their own so they never park
        // the shared pipeline.
        let fetch_conn = self.pool.dedicated().await?;
        let fetcher = BasicFetch::new(
            fetch_conn,
            &self.queues,
            self.fetch_timeout,
            Arc::clone(&self.shutdown),
        );

        tracing::debug!(processor = %self.label, "Processor started");

        loop {
            match fetcher.fetch().await? {
                Some(unit) => self.process(unit).await?,
                None => {
                    // Idle timeout, or shutdown observed at the poll
                    // boundary.
                    if fetcher.is_shutdown() {
                        tracing::info!(processor = %self.label, "Processor stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Execute one popped payload to completion.
    ///
    /// Returns `Err` only for infrastructure failures; in that case the
    /// payload has been requeued (best effort) before the error surfaces.
    async fn process(&self, unit: UnitOfWork) -> Result<(), WorkerError> {
        let mut job = match Job::decode(&unit.payload) {
            Ok(job) => job,
            Err(e) => {
                // The pop already acknowledged the payload; a record we
                // cannot decode has nowhere to go but the logs.
                tracing::error!(
                    processor = %self.label,
                    queue = %unit.queue,
                    error = %e,
                    "Discarding undecodable payload"
                );
                metrics::record_job_processed(&unit.queue, JobStatus::Discarded);
                return Ok(());
            }
        };

        let ctx = JobContext::new(unit.queue.clone(), self.label.clone());
        let start = Instant::now();

        match self.chain.invoke(&mut job, &ctx, &NoopTerminal).await {
            Ok(()) => {
                metrics::record_job_processed(&unit.queue, JobStatus::Success);
                metrics::record_job_duration(&unit.queue, start.elapsed());
                Ok(())
            }
            Err(e) if e.is_job_failure() => {
                // Already bookkept by the retry middleware and logged by
                // the logger entry; the processor just keeps going.
                metrics::record_job_processed(&unit.queue, JobStatus::Failed);
                metrics::record_job_duration(&unit.queue, start.elapsed());
                Ok(())
            }
            Err(e) => {
                // Infrastructure failure mid-flight. Put the unit back so
                // another processor can pick it up, then die.
                if let Err(requeue_err) = unit.requeue(&self.pool.shared()).await {
                    tracing::error!(
                        processor = %self.label,
                        jid = %job.jid,
                        error = %requeue_err,
                        "Failed to requeue in-flight job, payload lost"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::middleware::{Next, ServerMiddleware};
    use crate::registry::{DispatchMiddleware, HandlerRegistry, JobHandler};
    use crate::retry::{FixedJitter, RetryMiddleware};
    use async_trait::async_trait;
    use core_config::redis::RedisConfig;
    use redis::AsyncCommands;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_utils::TestRedis;

    async fn pool(redis: &TestRedis) -> RedisPool {
        RedisPool::connect(&RedisConfig::new(redis.connection_string().to_string()))
            .await
            .unwrap()
    }

    struct CountingHandler {
        performed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn perform(&self, _job: &Job, _ctx: &JobContext) -> Result<(), WorkerError> {
            self.performed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Middleware that fails with an infrastructure-shaped error.
    struct TornPipe;

    #[async_trait]
    impl ServerMiddleware for TornPipe {
        fn name(&self) -> &str {
            "torn-pipe"
        }

        async fn call(
            &self,
            _job: &mut Job,
            _ctx: &JobContext,
            _next: Next<'_>,
        ) -> Result<(), WorkerError> {
            Err(WorkerError::Decode(
                serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            ))
        }
    }

    fn processor_with_chain(
        pool: RedisPool,
        chain: MiddlewareChain,
        shutdown: Arc<AtomicBool>,
    ) -> Processor {
        Processor::new(
            pool,
            &["default".to_string()],
            Duration::from_millis(200),
            Arc::new(chain),
            shutdown,
        )
    }

    #[tokio::test]
    async fn test_processor_executes_fetched_jobs_until_shutdown() {
        let redis = TestRedis::new().await;
        let pool = pool(&redis).await;

        let performed = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "HardWorker",
            Arc::new(CountingHandler {
                performed: Arc::clone(&performed),
            }),
        );

        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(RetryMiddleware::with_jitter(
            pool.shared(),
            Arc::new(FixedJitter(0)),
        )));
        chain.add(Arc::new(DispatchMiddleware::new(Arc::new(registry))));

        let mut push = pool.shared();
        for _ in 0..3 {
            let payload = Job::new("HardWorker").encode().unwrap();
            let _: () = push.lpush("queue:default", payload).await.unwrap();
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let processor = processor_with_chain(pool, chain, Arc::clone(&shutdown));

        let handle = tokio::spawn(async move { processor.run().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.store(true, Ordering::Relaxed);

        handle.await.unwrap().unwrap(); // voluntary stop
        assert_eq!(performed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_discarded() {
        let redis = TestRedis::new().await;
        let pool = pool(&redis).await;

        let chain = MiddlewareChain::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let processor = processor_with_chain(pool.clone(), chain, shutdown);

        let unit = UnitOfWork {
            queue: "default".to_string(),
            payload: "{definitely not json".to_string(),
        };
        processor.process(unit).await.unwrap();

        // Nothing requeued, nothing scheduled.
        let mut check = pool.shared();
        let len: usize = check.llen("queue:default").await.unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_requeues_and_surfaces() {
        let redis = TestRedis::new().await;
        let pool = pool(&redis).await;

        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(TornPipe));

        let shutdown = Arc::new(AtomicBool::new(false));
        let processor = processor_with_chain(pool.clone(), chain, shutdown);

        let payload = Job::new("HardWorker").encode().unwrap();
        let unit = UnitOfWork {
            queue: "default".to_string(),
            payload: payload.clone(),
        };

        let err = processor.process(unit).await.unwrap_err();
        assert!(!err.is_job_failure());

        // The in-flight payload went back onto its queue.
        let mut check = pool.shared();
        let requeued: Vec<String> = check.lrange("queue:default", 0, -1).await.unwrap();
        assert_eq!(requeued, vec![payload]);
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_kill_processor() {
        let redis = TestRedis::new().await;
        let pool = pool(&redis).await;

        // Dispatch with an empty registry raises NoHandler for every job.
        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(RetryMiddleware::with_jitter(
            pool.shared(),
            Arc::new(FixedJitter(0)),
        )));
        chain.add(Arc::new(DispatchMiddleware::new(Arc::new(
            HandlerRegistry::new(),
        ))));

        let shutdown = Arc::new(AtomicBool::new(false));
        let processor = processor_with_chain(pool, chain, shutdown);

        let payload = Job::new("Ghost").encode().unwrap();
        let unit = UnitOfWork {
            queue: "default".to_string(),
            payload,
        };
        processor.process(unit).await.unwrap(); // absorbed, loop would continue
    }
}
