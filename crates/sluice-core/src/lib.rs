//! # Sluice Core
//!
//! Task scheduling core for Sluice, a client-side toolkit for uploading large
//! files in resumable chunks.
//!
//! This crate provides:
//! - A bounded-concurrency [`Scheduler`] with pause/resume and cancellation
//! - Per-task retries with constant or exponential delay
//! - Index-addressed results and a list of permanently failed tasks
//! - Scheduler configuration and error types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Scheduler                                │
//! │   (queue, admission, state machine, result slots)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Attempt chains                             │
//! │   (one tokio task per admitted task: execute, retry, settle)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Executor                                 │
//! │   (caller-supplied async fn, observes its CancelSignal)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod scheduler;
pub mod task;

pub use config::{SchedulerConfig, default_concurrency};
pub use error::{Result, SchedulerError, TaskError};
pub use scheduler::Scheduler;
pub use task::{CancelSignal, RunReport, Task, TaskFuture, TaskState};
