//! Error types for the file pipeline

use sluice_core::SchedulerError;
use std::borrow::Cow;
use thiserror::Error;

/// File pipeline errors
#[derive(Debug, Error)]
pub enum FilesError {
    /// Zero-length source, rejected before any work is scheduled
    #[error("Empty input: nothing to chunk or hash")]
    EmptyInput,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hash worker failed; the whole hash computation is aborted
    #[error("Hash worker {worker_index} failed: {message}")]
    HashWorker {
        /// Index of the failing worker
        worker_index: usize,
        /// Failure reported by the worker
        message: String,
    },

    /// Worker pool unavailable (shut down or channel closed)
    #[error("Worker pool error: {0}")]
    WorkerPool(Cow<'static, str>),

    /// String is not a valid content id
    #[error("Invalid content id: {0}")]
    InvalidContentId(String),

    /// Upload record (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scheduler error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl FilesError {
    /// Create a worker pool error with static context (zero allocation)
    #[must_use]
    pub const fn worker_pool(context: &'static str) -> Self {
        FilesError::WorkerPool(Cow::Borrowed(context))
    }
}

/// Result type for file pipeline operations
pub type Result<T> = std::result::Result<T, FilesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FilesError::HashWorker {
            worker_index: 3,
            message: "read failed".to_string(),
        };
        assert_eq!(err.to_string(), "Hash worker 3 failed: read failed");

        assert!(FilesError::EmptyInput.to_string().contains("Empty input"));
    }

    #[test]
    fn test_from_scheduler_error() {
        let err: FilesError = SchedulerError::Cleared.into();
        assert!(matches!(err, FilesError::Scheduler(SchedulerError::Cleared)));
        assert_eq!(err.to_string(), "Scheduler cleared before completion");
    }
}
