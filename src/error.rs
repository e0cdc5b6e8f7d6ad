use thiserror::Error;

use crate::job::{ErrorKind, JobStatus};

#[derive(Error, Debug)]
pub enum SubflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Admission rejected: {0}")]
    Admission(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job deadline exceeded: {0}")]
    Timeout(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubflowError {
    /// Classify this error for retry and reporting purposes.
    ///
    /// Provider and I/O failures are treated as transient; anything that
    /// points at bad input or a broken invariant is not retried.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubflowError::Validation(_) => ErrorKind::Validation,
            SubflowError::Timeout(_) => ErrorKind::Timeout,
            SubflowError::Cancelled => ErrorKind::Cancelled,
            SubflowError::Io(_)
            | SubflowError::Http(_)
            | SubflowError::Transcription(_)
            | SubflowError::Translation(_)
            | SubflowError::Media(_)
            | SubflowError::Storage(_)
            | SubflowError::Notification(_) => ErrorKind::Transient,
            SubflowError::Json(_)
            | SubflowError::Toml(_)
            | SubflowError::Config(_)
            | SubflowError::Admission(_)
            | SubflowError::JobNotFound(_)
            | SubflowError::InvalidTransition { .. }
            | SubflowError::Store(_)
            | SubflowError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the phase runner may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, SubflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(SubflowError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(SubflowError::Translation("503".into()).kind(), ErrorKind::Transient);
        assert_eq!(SubflowError::Internal("bug".into()).kind(), ErrorKind::Fatal);
        assert_eq!(SubflowError::Timeout("late".into()).kind(), ErrorKind::Timeout);
        assert!(SubflowError::Media("ffmpeg".into()).is_retryable());
        assert!(!SubflowError::Validation("bad".into()).is_retryable());
    }
}
