//! The server controller.
//!
//! Owns configuration, the middleware chain, the handler registry, and the
//! processor set. Supervisory operations (`processor_died`,
//! `processor_stopped`, `request_stop`) are serialized behind one mutex;
//! shutdown is a single atomic flag sampled by fetchers at their poll
//! boundaries. Processor tasks never touch the set themselves - they only
//! send notifications back to the supervisory loop in [`Server::run`].

use crate::error::WorkerError;
use crate::middleware::{LoggerMiddleware, MiddlewareChain};
use crate::processor::Processor;
use crate::registry::{DispatchMiddleware, HandlerRegistry};
use crate::redis::RedisPool;
use crate::retry::{Jitter, RetryMiddleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of processors to run.
    pub concurrency: usize,

    /// Queues to fetch from, highest priority first.
    pub queues: Vec<String>,

    /// Blocking-pop timeout; also the latency bound for observing shutdown
    /// while idle.
    pub fetch_timeout: Duration,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the processor count (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the queues to fetch from, highest priority first.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        if !queues.is_empty() {
            self.queues = queues;
        }
        self
    }

    /// Set the blocking-pop timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![crate::job::DEFAULT_QUEUE.to_string()],
            fetch_timeout: Duration::from_secs(2),
        }
    }
}

/// Notification sent from a processor task to the supervisory loop.
enum ProcessorEvent {
    /// Voluntary exit after shutdown.
    Stopped(Uuid),
    /// Involuntary death with its cause.
    Died(Uuid, WorkerError),
}

struct SupervisorState {
    processors: Vec<Processor>,
}

/// The controller: supervises processors and coordinates shutdown.
pub struct Server {
    config: ServerConfig,
    pool: RedisPool,
    chain: Mutex<MiddlewareChain>,
    shutdown: Arc<AtomicBool>,
    state: Mutex<SupervisorState>,
}

impl Server {
    /// Build a server with the default middleware chain: logger, retry,
    /// handler dispatch.
    pub fn new(pool: RedisPool, registry: HandlerRegistry, config: ServerConfig) -> Self {
        Self::with_jitter(
            pool,
            registry,
            config,
            Arc::new(crate::retry::ThreadRngJitter),
        )
    }

    /// Build a server with an injected backoff jitter source.
    pub fn with_jitter(
        pool: RedisPool,
        registry: HandlerRegistry,
        config: ServerConfig,
        jitter: Arc<dyn Jitter>,
    ) -> Self {
        let mut chain = MiddlewareChain::new();
        chain.add(Arc::new(LoggerMiddleware::new()));
        chain.add(Arc::new(RetryMiddleware::with_jitter(pool.shared(), jitter)));
        chain.add(Arc::new(DispatchMiddleware::new(Arc::new(registry))));

        Self {
            config,
            pool,
            chain: Mutex::new(chain),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SupervisorState {
                processors: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Snapshot of the middleware chain.
    pub fn middleware(&self) -> MiddlewareChain {
        self.chain.lock().unwrap().clone()
    }

    /// Mutate the middleware chain. Entries meant to wrap handler execution
    /// belong before the `dispatch` entry
    /// (`chain.insert_before("dispatch", ..)`). Only effective before
    /// `run`; processors snapshot the chain when they are built.
    pub fn configure_middleware(&self, configure: impl FnOnce(&mut MiddlewareChain)) {
        configure(&mut self.chain.lock().unwrap());
    }

    /// Request shutdown. Idempotent; running jobs complete, idle fetchers
    /// observe the flag at their next poll boundary.
    pub fn request_stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    /// Whether stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Snapshot of the live processor set.
    pub fn processors(&self) -> Vec<Processor> {
        self.state.lock().unwrap().processors.clone()
    }

    /// Record a voluntary processor exit. Removes the processor if present;
    /// an unknown or absent handle is a no-op (a processor may have died
    /// and stopped in the same breath).
    pub fn processor_stopped(&self, id: Option<Uuid>) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = id
            && let Some(pos) = state.processors.iter().position(|p| p.id() == id)
        {
            let processor = state.processors.remove(pos);
            info!(processor = %processor.label(), remaining = %state.processors.len(), "Processor stopped");
        }
    }

    /// Record an involuntary processor death and, unless stopping, spawn a
    /// replacement into the set and return it.
    ///
    /// `None` as the id means the source is unknown (or this is the initial
    /// spawn); nothing is removed, a processor is still added. While
    /// stopping, the dead processor is only removed and `None` comes back.
    pub fn processor_died(&self, id: Option<Uuid>, cause: Option<WorkerError>) -> Option<Processor> {
        let mut state = self.state.lock().unwrap();

        if let Some(id) = id
            && let Some(pos) = state.processors.iter().position(|p| p.id() == id)
        {
            let dead = state.processors.remove(pos);
            warn!(
                processor = %dead.label(),
                cause = %cause.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string()),
                "Processor died"
            );
        }

        if self.is_stopping() {
            return None;
        }

        let replacement = self.build_processor();
        state.processors.push(replacement.clone());
        Some(replacement)
    }

    fn build_processor(&self) -> Processor {
        let chain = Arc::new(self.chain.lock().unwrap().clone());
        Processor::new(
            self.pool.clone(),
            &self.config.queues,
            self.config.fetch_timeout,
            chain,
            Arc::clone(&self.shutdown),
        )
    }

    fn spawn(&self, processor: Processor, events: mpsc::UnboundedSender<ProcessorEvent>) {
        tokio::spawn(async move {
            let id = processor.id();
            let outcome = processor.run().await;
            let _ = match outcome {
                Ok(()) => events.send(ProcessorEvent::Stopped(id)),
                Err(cause) => events.send(ProcessorEvent::Died(id, cause)),
            };
        });
    }

    /// Run the worker pool until shutdown quiesces it.
    ///
    /// Spawns `concurrency` processors, replaces the ones that die, and
    /// resolves once stop has been requested and the last processor has
    /// exited.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(
            concurrency = %self.config.concurrency,
            queues = ?self.config.queues,
            "Starting worker pool"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        for _ in 0..self.config.concurrency {
            if let Some(processor) = self.processor_died(None, None) {
                self.spawn(processor, events_tx.clone());
            }
        }

        // Stop was requested before anything spawned.
        if self.state.lock().unwrap().processors.is_empty() {
            info!("Worker pool quiesced");
            return Ok(());
        }

        while let Some(event) = events_rx.recv().await {
            match event {
                ProcessorEvent::Stopped(id) => {
                    self.processor_stopped(Some(id));
                }
                ProcessorEvent::Died(id, cause) => {
                    if let Some(replacement) = self.processor_died(Some(id), Some(cause)) {
                        self.spawn(replacement, events_tx.clone());
                    }
                }
            }

            if self.is_stopping() && self.state.lock().unwrap().processors.is_empty() {
                break;
            }
        }

        info!("Worker pool quiesced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::job::Job;
    use crate::middleware::{JobContext, Next, ServerMiddleware};
    use crate::registry::JobHandler;
    use async_trait::async_trait;
    use core_config::redis::RedisConfig;
    use std::sync::atomic::AtomicUsize;
    use test_utils::TestRedis;

    async fn pool(redis: &TestRedis) -> RedisPool {
        RedisPool::connect(&RedisConfig::new(redis.connection_string().to_string()))
            .await
            .unwrap()
    }

    struct Nop;

    #[async_trait]
    impl ServerMiddleware for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        async fn call(
            &self,
            job: &mut Job,
            ctx: &JobContext,
            next: Next<'_>,
        ) -> Result<(), WorkerError> {
            next.run(job, ctx).await
        }
    }

    async fn server(redis: &TestRedis) -> Server {
        Server::new(pool(redis).await, HandlerRegistry::new(), ServerConfig::default())
    }

    #[tokio::test]
    async fn test_default_chain_has_three_entries() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        let names: Vec<String> = srv
            .middleware()
            .entries()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["logger", "retry", "dispatch"]);

        srv.configure_middleware(|chain| chain.insert_before("dispatch", Arc::new(Nop)));
        assert_eq!(srv.middleware().entries().len(), 4);
    }

    #[tokio::test]
    async fn test_request_stop_is_idempotent() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        assert!(!srv.is_stopping());
        srv.request_stop();
        assert!(srv.is_stopping());
        srv.request_stop();
        assert!(srv.is_stopping());
    }

    #[tokio::test]
    async fn test_supervision_lifecycle() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        assert_eq!(srv.processors().len(), 0);

        // Unknown source: spawn the initial processor.
        let p1 = srv.processor_died(None, None).expect("initial spawn");
        assert_eq!(srv.processors().len(), 1);

        // Stopping an unknown handle changes nothing.
        srv.processor_stopped(None);
        srv.processor_stopped(Some(Uuid::new_v4()));
        assert_eq!(srv.processors().len(), 1);

        // A known death is replaced one for one.
        let p2 = srv
            .processor_died(Some(p1.id()), None)
            .expect("replacement");
        assert_ne!(p1.id(), p2.id());
        assert_eq!(srv.processors().len(), 1);

        // After stop: no replacement, set drains to empty.
        srv.request_stop();
        assert!(srv.processor_died(Some(p2.id()), None).is_none());
        assert_eq!(srv.processors().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_death_while_running_adds_processor() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        srv.processor_died(None, None);
        srv.processor_died(None, None);
        assert_eq!(srv.processors().len(), 2);
    }

    #[tokio::test]
    async fn test_processor_stopped_removes_known_handle() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        let p = srv.processor_died(None, None).unwrap();
        srv.processor_stopped(Some(p.id()));
        assert_eq!(srv.processors().len(), 0);

        // Second notification for the same handle is harmless.
        srv.processor_stopped(Some(p.id()));
        assert_eq!(srv.processors().len(), 0);
    }

    #[tokio::test]
    async fn test_no_replacement_while_stopping() {
        let redis = TestRedis::new().await;
        let srv = server(&redis).await;

        let p = srv.processor_died(None, None).unwrap();
        srv.request_stop();

        assert!(srv.processor_died(None, None).is_none());
        assert!(srv.processor_died(Some(p.id()), None).is_none());
        assert_eq!(srv.processors().len(), 0);
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

    #[tokio::test]
    async fn test_run_processes_jobs_and_quiesces_on_stop() {
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

        let client = Client::new(pool.shared());
        for _ in 0..5 {
            client.push(Job::new("HardWorker")).await.unwrap();
        }

        let srv = Arc::new(Server::new(
            pool,
            registry,
            ServerConfig::new()
                .with_concurrency(2)
                .with_fetch_timeout(Duration::from_millis(200)),
        ));

        let runner = {
            let srv = Arc::clone(&srv);
            tokio::spawn(async move { srv.run().await })
        };

        tokio::time::sleep(Duration::from_millis(800)).await;
        srv.request_stop();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("pool quiesces after stop")
            .unwrap()
            .unwrap();

        assert_eq!(performed.load(Ordering::SeqCst), 5);
        assert_eq!(srv.processors().len(), 0);
    }
}
