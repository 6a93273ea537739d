//! Prometheus metrics for the worker.
//!
//! ## Available Metrics
//!
//! - `worker_jobs_processed_total` - Counter of jobs processed by status
//! - `worker_job_duration_seconds` - Histogram of job execution time
//! - `worker_job_retries_total` - Counter of scheduled retries
//! - `worker_jobs_dead_total` - Counter of jobs sent to the dead set
//! - `worker_queue_depth` - Gauge of pending payloads per queue

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_PROCESSED: &str = "worker_jobs_processed_total";
    pub const JOB_DURATION: &str = "worker_job_duration_seconds";
    pub const RETRIES: &str = "worker_job_retries_total";
    pub const DEAD: &str = "worker_jobs_dead_total";
    pub const QUEUE_DEPTH: &str = "worker_queue_depth";
}

/// Job outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum JobStatus {
    Success,
    Failed,
    Discarded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at application startup; the returned handle renders the
/// Prometheus text format.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle.
///
/// Returns None if metrics haven't been initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a job as processed with the given outcome.
pub fn record_job_processed(queue: &str, status: JobStatus) {
    counter!(
        names::JOBS_PROCESSED,
        "queue" => queue.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

/// Record how long a job took to execute.
pub fn record_job_duration(queue: &str, duration: Duration) {
    histogram!(
        names::JOB_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one scheduled retry.
pub fn record_retry(queue: &str) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record one burial in the dead set.
pub fn record_dead(queue: &str) {
    counter!(
        names::DEAD,
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Update the pending-payload gauge for a queue.
pub fn set_queue_depth(queue: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "queue" => queue.to_string()
    )
    .set(depth);
}
