//! Health check handlers for worker services.
//!
//! Reusable Axum handlers for:
//! - Liveness probes (`/health`)
//! - Readiness probes (`/ready`)
//! - Queue monitoring (`/queues/info`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::metrics;
use crate::redis::{queue_key, DEAD_SET, RETRY_SET};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Redis connection for probes and queue stats.
    pub redis: ConnectionManager,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Queues this worker fetches from.
    pub queues: Vec<String>,
}

impl HealthState {
    pub fn new(
        redis: ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            redis,
            app_name: app_name.into(),
            app_version: app_version.into(),
            queues,
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler. Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler. Checks that Redis answers a PING.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let mut conn = state.redis.clone();

    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(response) if response == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" }
            })),
        )),
        Ok(response) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("unexpected response: {}", response) }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue monitoring handler: pending depth per queue plus retry and dead
/// set sizes. Also refreshes the queue-depth gauges.
pub async fn queues_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut conn = state.redis.clone();
    let mut depths = serde_json::Map::new();

    for queue in &state.queues {
        let depth: i64 = redis::cmd("LLEN")
            .arg(queue_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("Failed to read queue depth: {}", e) })),
                )
            })?;

        metrics::set_queue_depth(queue, depth as f64);
        depths.insert(queue.clone(), json!(depth));
    }

    let retry_size: i64 = redis::cmd("ZCARD")
        .arg(RETRY_SET)
        .query_async(&mut conn)
        .await
        .unwrap_or(0);
    let dead_size: i64 = redis::cmd("ZCARD")
        .arg(DEAD_SET)
        .query_async(&mut conn)
        .await
        .unwrap_or(0);

    Ok(Json(json!({
        "queues": depths,
        "retry": retry_size,
        "dead": dead_size,
    })))
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => {
            let metrics_output = handle.render();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                metrics_output,
            )
                .into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with every health endpoint wired up.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/queues/info", get(queues_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
