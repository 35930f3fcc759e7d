//! Error types for the scheduler and for individual tasks
//!
//! Two layers of failure are kept apart:
//!
//! - [`TaskError`] is what an executor returns for a single attempt. The
//!   scheduler recovers from it locally (retry) and finally records it in the
//!   result slot of the task. It never aborts a run.
//! - [`SchedulerError`] is what the scheduler itself returns from its own
//!   operations: misuse (invalid state or configuration), teardown via
//!   `clear()`, or an exceeded error budget.
//!
//! # Example
//!
//! ```
//! use sluice_core::TaskError;
//!
//! fn classify(err: &TaskError) -> &'static str {
//!     if err.is_cancelled() {
//!         "cancelled, will be rescheduled"
//!     } else if err.is_retryable() {
//!         "transient, will retry"
//!     } else {
//!         "permanent"
//!     }
//! }
//!
//! assert_eq!(classify(&TaskError::failed("503")), "transient, will retry");
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Failure of a single executor attempt
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure, retried while budget remains
    #[error("Task failed: {0}")]
    Failed(Cow<'static, str>),

    /// Permanent failure, remaining retries are skipped
    #[error("Task failed permanently: {0}")]
    Fatal(Cow<'static, str>),

    /// The executor observed its cancellation signal
    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Create a transient failure
    #[must_use]
    pub fn failed(context: impl Into<Cow<'static, str>>) -> Self {
        TaskError::Failed(context.into())
    }

    /// Create a permanent failure
    #[must_use]
    pub fn fatal(context: impl Into<Cow<'static, str>>) -> Self {
        TaskError::Fatal(context.into())
    }

    /// Returns true if another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_))
    }

    /// Returns true if this attempt ended because it was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => TaskError::Fatal(err.to_string().into()),
            _ => TaskError::Failed(err.to_string().into()),
        }
    }
}

/// Errors returned by scheduler operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Operation not valid in the current scheduler state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// The scheduler was torn down with `clear()` before the run drained
    #[error("Scheduler cleared before completion")]
    Cleared,

    /// More tasks failed permanently than the configured budget allows
    #[error("Error budget exceeded: {failed} tasks failed (budget {budget})")]
    ErrorBudgetExceeded {
        /// Permanently failed tasks at the time of abort
        failed: usize,
        /// Configured budget
        budget: usize,
    },
}

impl SchedulerError {
    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        SchedulerError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        SchedulerError::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_classification() {
        assert!(TaskError::failed("timeout").is_retryable());
        assert!(!TaskError::fatal("bad request").is_retryable());
        assert!(!TaskError::Cancelled.is_retryable());
        assert!(TaskError::Cancelled.is_cancelled());
        assert!(!TaskError::failed("x").is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TaskError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TaskError::Fatal(_)));

        let err: TaskError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::ErrorBudgetExceeded {
            failed: 11,
            budget: 10,
        };
        assert_eq!(
            err.to_string(),
            "Error budget exceeded: 11 tasks failed (budget 10)"
        );

        let err = TaskError::failed("503 Service Unavailable");
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_convenience_constructors() {
        let err = SchedulerError::invalid_state("not paused");
        assert!(matches!(err, SchedulerError::InvalidState(_)));

        let err = SchedulerError::invalid_config("max_concurrent_tasks must be > 0");
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }
}
