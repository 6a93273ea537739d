//! Error types for job processing.
//!
//! Two families of failure flow through the worker:
//! - job failures (`Failed`, `NoHandler`) raised by handler code, consumed
//!   by the retry middleware and never allowed past the processor loop
//! - infrastructure failures (`Redis`) that bubble to the supervisor and
//!   count as involuntary processor death

use std::backtrace::Backtrace;
use thiserror::Error;

/// Errors that can occur while fetching, decoding, or executing jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A payload that could not be decoded into a job record.
    #[error("Failed to decode job payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// A failure raised by handler code while performing a job.
    #[error("{class}: {message}")]
    Failed {
        class: String,
        message: String,
        backtrace: Vec<String>,
    },

    /// The job names a handler class nothing was registered for.
    #[error("No handler registered for class '{0}'")]
    NoHandler(String),
}

impl WorkerError {
    /// Build a job failure, capturing the current backtrace when
    /// `RUST_BACKTRACE` enables one.
    pub fn failed(class: impl Into<String>, message: impl Into<String>) -> Self {
        let captured = Backtrace::capture();
        let frames = if captured.status() == std::backtrace::BacktraceStatus::Captured {
            captured.to_string().lines().map(str::to_owned).collect()
        } else {
            Vec::new()
        };

        Self::Failed {
            class: class.into(),
            message: message.into(),
            backtrace: frames,
        }
    }

    /// Build a job failure with explicit backtrace frames.
    pub fn failed_with_trace(
        class: impl Into<String>,
        message: impl Into<String>,
        backtrace: Vec<String>,
    ) -> Self {
        Self::Failed {
            class: class.into(),
            message: message.into(),
            backtrace,
        }
    }

    /// Whether this error came from the job itself (handler raised, or no
    /// handler resolved) rather than from infrastructure. Job failures are
    /// bookkept by the retry middleware; everything else escapes the chain.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::NoHandler(_))
    }

    /// The error class recorded into the job on failure.
    pub fn job_error_class(&self) -> &str {
        match self {
            Self::Failed { class, .. } => class,
            Self::NoHandler(_) => "NoHandler",
            Self::Redis(_) => "RedisError",
            Self::Decode(_) => "DecodeError",
        }
    }

    /// The error message recorded into the job on failure.
    pub fn job_error_message(&self) -> String {
        match self {
            Self::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Backtrace frames for this error, if any were captured.
    pub fn frames(&self) -> &[String] {
        match self {
            Self::Failed { backtrace, .. } => backtrace,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_display() {
        let err = WorkerError::failed_with_trace("RuntimeError", "boom", vec![]);
        assert_eq!(err.to_string(), "RuntimeError: boom");
    }

    #[test]
    fn test_job_failure_classification() {
        assert!(WorkerError::failed("RuntimeError", "boom").is_job_failure());
        assert!(WorkerError::NoHandler("HardWorker".to_string()).is_job_failure());

        let decode = WorkerError::Decode(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert!(!decode.is_job_failure());
    }

    #[test]
    fn test_error_class_and_message() {
        let err = WorkerError::failed_with_trace("ArgumentError", "missing arg", vec![]);
        assert_eq!(err.job_error_class(), "ArgumentError");
        assert_eq!(err.job_error_message(), "missing arg");

        let missing = WorkerError::NoHandler("Mailer".to_string());
        assert_eq!(missing.job_error_class(), "NoHandler");
        assert!(missing.job_error_message().contains("Mailer"));
    }

    #[test]
    fn test_explicit_frames() {
        let err = WorkerError::failed_with_trace(
            "RuntimeError",
            "boom",
            vec!["frame one".to_string(), "frame two".to_string()],
        );
        assert_eq!(err.frames().len(), 2);
        assert_eq!(err.frames()[0], "frame one");
    }
}
