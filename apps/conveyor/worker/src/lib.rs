//! Conveyor Worker Service
//!
//! A background worker that executes jobs from Redis list queues.
//!
//! ## Architecture
//!
//! ```text
//! Redis lists (queue:<name>)
//!   ↓ (BRPOP, priority order)
//! Server ── supervises ──▶ Processor × CONVEYOR_CONCURRENCY
//!   ↓ (middleware chain: logger → retry → dispatch)
//! registered JobHandlers
//!   ↓ (on failure)
//! retry / dead sorted sets
//! ```
//!
//! ## Environment
//!
//! - `REDIS_PROVIDER` / `REDIS_URL`: Redis URL, one level of indirection
//! - `CONVEYOR_CONCURRENCY`: processor count (default 10)
//! - `CONVEYOR_QUEUES`: comma-separated queue names, highest priority first
//! - `HEALTH_PORT`: health/metrics HTTP port (default 8081)
//! - `APP_ENV`: "production" switches logs to JSON

mod handlers;

use core_config::redis::RedisConfig;
use core_config::{env_or_default, env_parse_or, Environment, FromEnv};
use eyre::{Result, WrapErr};
use queue_worker::{metrics, HealthState, RedisPool, Server, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`
/// - Readiness probes: `/ready`
/// - Queue monitoring: `/queues/info`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app = queue_worker::health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the worker
///
/// This is the main entry point for the service. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to Redis through the provider-env indirection
/// 3. Registers job handlers
/// 4. Starts the supervised processor pool with graceful shutdown handling
///
/// # Errors
///
/// Returns an error if:
/// - Redis configuration is invalid
/// - Redis connection fails after retrying
/// - The worker pool encounters a fatal error
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, "Starting worker service");
    info!("Environment: {:?}", environment);

    let health_port: u16 = env_parse_or("HEALTH_PORT", 8081)?;

    let concurrency: usize = env_parse_or("CONVEYOR_CONCURRENCY", 10)?;
    let queues: Vec<String> = env_or_default("CONVEYOR_QUEUES", "default")
        .split(',')
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();

    let server_config = ServerConfig::new()
        .with_concurrency(concurrency)
        .with_queues(queues)
        .with_fetch_timeout(Duration::from_secs(2));
    info!(
        concurrency = %server_config.concurrency,
        queues = ?server_config.queues,
        "Worker configuration loaded"
    );

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let pool = RedisPool::connect_with_retry(&redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let registry = handlers::registry();
    info!(handlers = %registry.len(), "Job handlers registered");

    let health_state = HealthState::new(
        pool.shared(),
        app_name,
        app_version,
        server_config.queues.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let server = Arc::new(Server::new(pool, registry, server_config));

    // Flip the stop flag on SIGINT/SIGTERM; running jobs finish, idle
    // fetchers notice at their next poll boundary.
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                error!("Error waiting for shutdown signal: {}", e);
            }
            server.request_stop();
        });
    }

    server.run().await.map_err(|e| eyre::eyre!("{}", e))?;

    info!("Worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
