//! Redis key layout and connection handling.

use crate::error::WorkerError;
use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::{info, warn};

/// Sorted set of failed jobs scheduled for re-execution.
pub const RETRY_SET: &str = "retry";

/// Sorted set of jobs whose retries are exhausted.
pub const DEAD_SET: &str = "dead";

/// Set of known queue names.
pub const QUEUES_SET: &str = "queues";

/// List key for a named queue.
pub fn queue_key(name: &str) -> String {
    format!("queue:{}", name)
}

/// Redis handle shared across the worker.
///
/// One multiplexed connection serves regular commands; blocking pops must
/// not ride on it (a BRPOP parks the whole multiplexed pipeline for its
/// timeout), so each fetcher checks out a dedicated connection instead.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    shared: ConnectionManager,
}

impl RedisPool {
    /// Connect to Redis.
    pub async fn connect(config: &RedisConfig) -> Result<Self, WorkerError> {
        let client = Client::open(config.url.as_str())?;
        let shared = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, shared })
    }

    /// Connect with bounded exponential backoff, for service startup where
    /// Redis may come up after the worker does.
    ///
    /// `max_attempts` of `None` means 10.
    pub async fn connect_with_retry(
        config: &RedisConfig,
        max_attempts: Option<u32>,
    ) -> Result<Self, WorkerError> {
        const MAX_BACKOFF_SECS: u64 = 30;
        let max_attempts = max_attempts.unwrap_or(10);
        let mut attempt: u32 = 0;

        loop {
            match Self::connect(config).await {
                Ok(pool) => {
                    if attempt > 0 {
                        info!(attempt = %(attempt + 1), "Connected to Redis after retrying");
                    }
                    return Ok(pool);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    let backoff_secs = std::cmp::min(2u64.pow(attempt.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        attempt = %attempt,
                        backoff_secs = %backoff_secs,
                        "Redis connection failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
            }
        }
    }

    /// The shared multiplexed connection, for regular commands.
    pub fn shared(&self) -> ConnectionManager {
        self.shared.clone()
    }

    /// Check out a fresh connection of its own, for blocking commands.
    pub async fn dedicated(&self) -> Result<ConnectionManager, WorkerError> {
        Ok(ConnectionManager::new(self.client.clone()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::TestRedis;

    #[test]
    fn test_queue_key_layout() {
        assert_eq!(queue_key("default"), "queue:default");
        assert_eq!(queue_key("critical"), "queue:critical");
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let config = RedisConfig::new("not-a-redis-url".to_string());
        assert!(RedisPool::connect(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_pool_hands_out_connections() {
        let redis = TestRedis::new().await;
        let pool = RedisPool::connect(&RedisConfig::new(redis.connection_string().to_string()))
            .await
            .unwrap();

        let mut shared = pool.shared();
        let pong: String = redis::cmd("PING").query_async(&mut shared).await.unwrap();
        assert_eq!(pong, "PONG");

        let mut dedicated = pool.dedicated().await.unwrap();
        let pong: String = redis::cmd("PING").query_async(&mut dedicated).await.unwrap();
        assert_eq!(pong, "PONG");
    }
}
