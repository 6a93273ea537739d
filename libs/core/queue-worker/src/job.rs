//! The job record and its JSON wire format.
//!
//! Producers write job records as JSON payloads onto Redis lists; this
//! module decodes them, exposes the retry/backtrace policy rules, and
//! re-encodes records for the retry and dead sets. Fields this worker does
//! not recognize ride through the `extra` map untouched, so payloads written
//! by other producers round-trip unchanged.

use crate::error::WorkerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Queue used when a payload does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Max attempts when `retry: true`.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Frames kept when `backtrace: true`.
pub const DEFAULT_BACKTRACE_LIMIT: usize = 1000;

/// Retry policy as it appears on the wire: a boolean or an explicit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    Enabled(bool),
    Limit(u32),
}

/// Backtrace retention as it appears on the wire: a boolean or a frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktracePolicy {
    Enabled(bool),
    Limit(usize),
}

/// A unit of deferred work.
///
/// Lives for exactly one execution attempt: decoded from a popped payload,
/// pushed through the middleware chain, and discarded (possibly after being
/// re-serialized into the retry or dead set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier, unique per enqueue.
    pub jid: String,

    /// Handler class name, resolved through the handler registry.
    pub klass: String,

    /// Positional handler arguments. Handlers pull these out as typed
    /// values via [`Job::decode_args`].
    #[serde(default)]
    pub args: Vec<Value>,

    /// Queue name; absent on the wire means "default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Retry policy; absent means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Backtrace retention; absent means keep nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktracePolicy>,

    /// Number of failures so far; absent means the job never failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Epoch seconds of the first failure; set once, never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,

    /// Epoch seconds of the most recent retry attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,

    /// Message of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Class of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    /// Retained frames of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<Vec<String>>,

    /// Explicitly `false` keeps an exhausted job out of the dead set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,

    /// Fields this worker does not recognize; preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Job {
    /// Create a fresh job for the given handler class with a generated jid.
    pub fn new(klass: impl Into<String>) -> Self {
        Self {
            jid: Uuid::new_v4().simple().to_string(),
            klass: klass.into(),
            args: Vec::new(),
            queue: None,
            retry: None,
            backtrace: None,
            retry_count: None,
            failed_at: None,
            retried_at: None,
            error_message: None,
            error_class: None,
            error_backtrace: None,
            dead: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Set positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set the target queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the backtrace retention policy.
    pub fn with_backtrace(mut self, backtrace: BacktracePolicy) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    /// The queue this job belongs to.
    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    /// Maximum failures before the job is exhausted:
    /// `true` means 25, `false` or absent means none, an integer is explicit.
    pub fn max_retries(&self) -> u32 {
        match self.retry {
            Some(RetryPolicy::Enabled(true)) => DEFAULT_MAX_RETRIES,
            Some(RetryPolicy::Enabled(false)) | None => 0,
            Some(RetryPolicy::Limit(n)) => n,
        }
    }

    /// Backtrace frames to keep on failure:
    /// `true` means 1000, `false` or absent means none, an integer is explicit.
    pub fn backtrace_limit(&self) -> usize {
        match self.backtrace {
            Some(BacktracePolicy::Enabled(true)) => DEFAULT_BACKTRACE_LIMIT,
            Some(BacktracePolicy::Enabled(false)) | None => 0,
            Some(BacktracePolicy::Limit(n)) => n,
        }
    }

    /// Decode a job record from a JSON payload.
    pub fn decode(payload: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode this record back into its JSON payload.
    pub fn encode(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the `args` array into typed handler arguments.
    ///
    /// A mismatch is a job failure (`ArgumentError`), not a decode error:
    /// the payload itself was well-formed, the handler contract was not met.
    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T, WorkerError> {
        serde_json::from_value(Value::Array(self.args.clone()))
            .map_err(|e| WorkerError::failed_with_trace("ArgumentError", e.to_string(), vec![]))
    }
}

/// Current time as fractional epoch seconds, the wire format for all job
/// timestamps and sorted-set scores.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_minimal_payload() {
        let job = Job::decode(r#"{"jid":"abc123","klass":"HardWorker","args":[1,"x"]}"#).unwrap();

        assert_eq!(job.jid, "abc123");
        assert_eq!(job.klass, "HardWorker");
        assert_eq!(job.args, vec![json!(1), json!("x")]);
        assert_eq!(job.queue(), "default");
        assert_eq!(job.max_retries(), 0);
        assert_eq!(job.backtrace_limit(), 0);
        assert!(job.retry_count.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Job::decode("{not json").is_err());
        assert!(Job::decode(r#"{"args":[]}"#).is_err());
    }

    #[test]
    fn test_retry_policy_bool_or_int() {
        let on = Job::decode(r#"{"jid":"a","klass":"W","retry":true}"#).unwrap();
        assert_eq!(on.retry, Some(RetryPolicy::Enabled(true)));
        assert_eq!(on.max_retries(), 25);

        let off = Job::decode(r#"{"jid":"a","klass":"W","retry":false}"#).unwrap();
        assert_eq!(off.max_retries(), 0);

        let capped = Job::decode(r#"{"jid":"a","klass":"W","retry":3}"#).unwrap();
        assert_eq!(capped.retry, Some(RetryPolicy::Limit(3)));
        assert_eq!(capped.max_retries(), 3);
    }

    #[test]
    fn test_backtrace_policy_bool_or_int() {
        let on = Job::decode(r#"{"jid":"a","klass":"W","backtrace":true}"#).unwrap();
        assert_eq!(on.backtrace_limit(), 1000);

        let off = Job::decode(r#"{"jid":"a","klass":"W","backtrace":false}"#).unwrap();
        assert_eq!(off.backtrace_limit(), 0);

        let capped = Job::decode(r#"{"jid":"a","klass":"W","backtrace":12}"#).unwrap();
        assert_eq!(capped.backtrace_limit(), 12);
    }

    #[test]
    fn test_policy_round_trips_without_widening() {
        // A boolean must re-encode as a boolean, an integer as an integer.
        let payload = r#"{"jid":"a","klass":"W","retry":true,"backtrace":5}"#;
        let encoded = Job::decode(payload).unwrap().encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["retry"], json!(true));
        assert_eq!(value["backtrace"], json!(5));
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let payload = r#"{"jid":"a","klass":"W","args":[],"tags":["urgent"],"tenant":42}"#;
        let job = Job::decode(payload).unwrap();

        assert_eq!(job.extra.get("tags"), Some(&json!(["urgent"])));
        assert_eq!(job.extra.get("tenant"), Some(&json!(42)));

        let reencoded: Value = serde_json::from_str(&job.encode().unwrap()).unwrap();
        let original: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn test_decode_encode_identity() {
        let payload = concat!(
            r#"{"jid":"deadbeef","klass":"Mailer","args":[{"to":"x@y.z"}],"queue":"mail","#,
            r#""retry":4,"retry_count":1,"failed_at":1700000000.123456,"#,
            r#""retried_at":1700000100.5,"error_message":"boom","error_class":"RuntimeError","#,
            r#""dead":false,"created_at":1699999999.0}"#
        );
        let job = Job::decode(payload).unwrap();
        let round_tripped = Job::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(job, round_tripped);

        // Absent bookkeeping fields must stay absent on the wire.
        let bare = Job::new("HardWorker");
        let encoded: Value = serde_json::from_str(&bare.encode().unwrap()).unwrap();
        assert!(encoded.get("retry_count").is_none());
        assert!(encoded.get("failed_at").is_none());
        assert!(encoded.get("queue").is_none());
    }

    #[test]
    fn test_decode_args_typed() {
        let job = Job::new("HardWorker").with_args(vec![json!("report-7"), json!(3)]);
        let (name, priority): (String, u64) = job.decode_args().unwrap();
        assert_eq!(name, "report-7");
        assert_eq!(priority, 3);
    }

    #[test]
    fn test_decode_args_mismatch_is_job_failure() {
        let job = Job::new("HardWorker").with_args(vec![json!("oops")]);
        let err = job.decode_args::<(u64,)>().unwrap_err();
        assert!(err.is_job_failure());
        assert_eq!(err.job_error_class(), "ArgumentError");
    }

    #[test]
    fn test_builder_helpers() {
        let job = Job::new("HardWorker")
            .on_queue("critical")
            .with_retry(RetryPolicy::Limit(2))
            .with_backtrace(BacktracePolicy::Enabled(true));

        assert_eq!(job.queue(), "critical");
        assert_eq!(job.max_retries(), 2);
        assert_eq!(job.backtrace_limit(), 1000);
        assert_eq!(job.jid.len(), 32);
    }

    #[test]
    fn test_now_epoch_is_sane() {
        let now = now_epoch();
        // After 2023, before 2100.
        assert!(now > 1_670_000_000.0);
        assert!(now < 4_100_000_000.0);
    }
}
