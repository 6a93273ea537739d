//! Shared test utilities
//!
//! Reusable test infrastructure for the worker crates:
//! - `TestRedis`: Redis container with automatic cleanup
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//! use redis::AsyncCommands;
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let mut conn = redis.connection_manager().await;
//!
//!     conn.set::<_, _, ()>("key", "value").await.unwrap();
//!     let value: String = conn.get("key").await.unwrap();
//!     assert_eq!(value, "value");
//! }
//! ```

mod redis;

pub use redis::TestRedis;
