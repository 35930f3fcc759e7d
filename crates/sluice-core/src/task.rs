//! Task and result model shared by the scheduler and its clients.

use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cooperative cancellation signal handed to every executor attempt
pub type CancelSignal = CancellationToken;

/// Boxed future returned by a stored executor
pub type TaskFuture<R> = Pin<Box<dyn Future<Output = Result<R, TaskError>> + Send>>;

/// Type-erased executor as stored by the scheduler
pub(crate) type ExecutorFn<T, R> = Arc<dyn Fn(T, CancelSignal) -> TaskFuture<R> + Send + Sync>;

/// Progress callback, called with the cumulative number of settled tasks
pub(crate) type ProgressFn = Arc<dyn Fn(usize) + Send + Sync>;

/// One unit of work with a stable origin index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task<T> {
    /// Input handed to the executor
    pub data: T,
    /// Position in the original input list, addresses the result slot
    pub index: usize,
}

impl<T> Task<T> {
    /// Create a new task
    pub fn new(data: T, index: usize) -> Self {
        Self { data, index }
    }
}

/// Scheduler-wide state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Admitting and executing work
    Running,
    /// Not admitting work, in-flight tasks were cancelled and re-queued
    Paused,
    /// Drained or torn down
    Completed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

/// Outcome of a drained run
///
/// `results[i]` holds the value or final error of the task with index `i`.
/// A run that resolves without error may still contain failed tasks; check
/// [`RunReport::is_success`] or `error_tasks`.
#[derive(Debug, Clone)]
pub struct RunReport<T, R> {
    /// Index-addressed results, one slot per task
    pub results: Vec<Result<R, TaskError>>,
    /// Tasks whose retry budget was exhausted
    pub error_tasks: Vec<Task<T>>,
}

impl<T, R> RunReport<T, R> {
    /// Returns true if every task succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_tasks.is_empty() && self.results.iter().all(Result::is_ok)
    }

    /// Number of tasks that succeeded
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Number of tasks that failed permanently
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// All values in index order, or `None` if any task failed
    pub fn into_values(self) -> Option<Vec<R>> {
        self.results.into_iter().map(Result::ok).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Running.to_string(), "Running");
        assert_eq!(TaskState::Paused.to_string(), "Paused");
        assert_eq!(TaskState::Completed.to_string(), "Completed");
    }

    #[test]
    fn test_run_report_success() {
        let report: RunReport<u32, u32> = RunReport {
            results: vec![Ok(2), Ok(4)],
            error_tasks: vec![],
        };
        assert!(report.is_success());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.into_values(), Some(vec![2, 4]));
    }

    #[test]
    fn test_run_report_partial_failure() {
        let report: RunReport<u32, u32> = RunReport {
            results: vec![Ok(2), Err(TaskError::failed("boom"))],
            error_tasks: vec![Task::new(2, 1)],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed(), 1);
        assert_eq!(report.into_values(), None);
    }
}
