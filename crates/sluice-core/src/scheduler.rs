//! Bounded-concurrency task scheduler
//!
//! The [`Scheduler`] admits a list of tasks, runs at most
//! `max_concurrent_tasks` of them at the same time through a caller-supplied
//! executor, retries failures with a (cancellable) delay, and resolves with an
//! index-addressed result set plus the tasks that exhausted their retries.
//!
//! # Lifecycle
//!
//! ```text
//!            run() / resume()               queue empty and
//!   ┌────────────────────────────┐          nothing in flight
//!   │                            ▼       ┌──────────────────────┐
//! Paused ◄──── pause() ──── Running ─────┘                      ▼
//!                               │                           Completed
//!                               └──────── clear() ──────────────▲
//! ```
//!
//! Admission happens in exactly one place. It runs after `run()`, `resume()`,
//! `add_tasks()`, `retry_tasks()` and after every settled task, so the
//! concurrency cap holds no matter how completions are interleaved.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. Every admitted attempt chain gets its own
//! [`CancelSignal`] and a ticket. `pause()` fires the signal, puts the task
//! back at the front of the queue and invalidates the ticket; whatever the old
//! attempt eventually returns is discarded. A cancelled attempt never counts
//! against the retry budget; real failures before the pause still do, so a
//! task runs at most `max_retries + 1` uncancelled attempts per submission.
//!
//! # Example
//!
//! ```no_run
//! use sluice_core::{Scheduler, SchedulerConfig, TaskError};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(
//!     vec![10u32, 20, 30],
//!     SchedulerConfig::default().with_max_concurrent_tasks(2),
//! );
//! scheduler.on_progress_change(|done| println!("{done} settled"));
//!
//! let report = scheduler
//!     .run(|x, _cancel| async move { Ok::<_, TaskError>(x * 2) })
//!     .await?;
//!
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError, TaskError};
use crate::task::{CancelSignal, ExecutorFn, ProgressFn, RunReport, Task, TaskState};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type Waiter<T, R> = oneshot::Sender<Result<RunReport<T, R>>>;

/// Bounded-concurrency scheduler
///
/// Cheap to clone; clones share the same queue, so one handle can `pause()`
/// while another is awaiting `run()`.
pub struct Scheduler<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for Scheduler<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T, R> {
    config: SchedulerConfig,
    inner: Mutex<Inner<T, R>>,
    /// Held while a progress callback runs; `clear()` waits on it
    notify: Mutex<()>,
}

/// An admitted attempt chain
struct InFlight<T> {
    task: Task<T>,
    cancel: CancelSignal,
    ticket: u64,
}

/// Real (non-cancelled) failed attempts of one task since its last submission
#[derive(Default)]
struct FailureLog {
    count: u32,
    last: Option<TaskError>,
}

struct Inner<T, R> {
    state: TaskState,
    cleared: bool,
    queue: VecDeque<Task<T>>,
    in_flight: BTreeMap<usize, InFlight<T>>,
    results: Vec<Option<std::result::Result<R, TaskError>>>,
    failures: Vec<FailureLog>,
    error_tasks: Vec<Task<T>>,
    settled: usize,
    next_ticket: u64,
    executor: Option<ExecutorFn<T, R>>,
    runtime: Option<Handle>,
    progress: Option<ProgressFn>,
    waiter: Option<Waiter<T, R>>,
}

impl<T, R> Scheduler<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create a scheduler over `inputs`, queued in input order
    ///
    /// Nothing executes until [`Scheduler::run`] is called.
    pub fn new(inputs: Vec<T>, config: SchedulerConfig) -> Self {
        let queue: VecDeque<Task<T>> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, data)| Task::new(data, index))
            .collect();
        let results = std::iter::repeat_with(|| None).take(queue.len()).collect();
        let failures = std::iter::repeat_with(FailureLog::default)
            .take(queue.len())
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: TaskState::Running,
                    cleared: false,
                    queue,
                    in_flight: BTreeMap::new(),
                    results,
                    failures,
                    error_tasks: Vec::new(),
                    settled: 0,
                    next_ticket: 0,
                    executor: None,
                    runtime: None,
                    progress: None,
                    waiter: None,
                }),
                notify: Mutex::new(()),
            }),
        }
    }

    /// Start executing and wait until the queue is drained
    ///
    /// Resolves once the queue is empty and nothing is in flight. Tasks that
    /// exhausted their retries do not make the run fail; they show up as
    /// errors in `results` and in `error_tasks`.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidConfig`] if the configuration is invalid
    /// - [`SchedulerError::InvalidState`] if `run()` was already called
    /// - [`SchedulerError::Cleared`] if `clear()` tore the scheduler down
    /// - [`SchedulerError::ErrorBudgetExceeded`] if the error budget was exceeded
    pub async fn run<F, Fut>(&self, executor: F) -> Result<RunReport<T, R>>
    where
        F: Fn(T, CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        self.shared.config.validate()?;

        let executor: ExecutorFn<T, R> =
            Arc::new(move |data, cancel| Box::pin(executor(data, cancel)));

        let rx = {
            let mut inner = self.shared.lock();
            if inner.cleared {
                return Err(SchedulerError::Cleared);
            }
            if inner.executor.is_some() {
                return Err(SchedulerError::invalid_state(
                    "run() may only be called once per scheduler",
                ));
            }

            inner.executor = Some(executor);
            inner.runtime = Some(Handle::current());
            inner.state = TaskState::Running;

            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);

            info!(
                "Scheduler run started ({} tasks, max_concurrent={}, max_retries={})",
                inner.queue.len(),
                self.shared.config.max_concurrent_tasks,
                self.shared.config.max_retries
            );

            self.shared.admit(&mut inner);
            rx
        };

        rx.await.unwrap_or(Err(SchedulerError::Cleared))
    }

    /// Stop admitting work and cancel everything in flight
    ///
    /// In-flight tasks are re-queued at the front, in index order. Executors
    /// are only signalled; the call does not wait for them to stop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidState`] unless the scheduler is running.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.state != TaskState::Running {
            return Err(SchedulerError::invalid_state("pause() requires Running"));
        }

        inner.state = TaskState::Paused;

        let in_flight = std::mem::take(&mut inner.in_flight);
        let requeued = in_flight.len();
        for flight in in_flight.into_values().rev() {
            flight.cancel.cancel();
            inner.queue.push_front(flight.task);
        }

        info!(
            "Scheduler paused ({} in-flight tasks re-queued, {} queued)",
            requeued,
            inner.queue.len()
        );
        Ok(())
    }

    /// Resume admitting work after [`Scheduler::pause`]
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidState`] unless the scheduler is paused.
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.state != TaskState::Paused {
            return Err(SchedulerError::invalid_state("resume() requires Paused"));
        }

        inner.state = TaskState::Running;
        info!("Scheduler resumed ({} queued)", inner.queue.len());

        self.shared.admit(&mut inner);
        Ok(())
    }

    /// Append new work, returning the indices assigned to it
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidState`] once the scheduler completed.
    pub fn add_tasks(&self, inputs: Vec<T>) -> Result<Vec<usize>> {
        let mut inner = self.shared.lock();
        if inner.state == TaskState::Completed {
            return Err(SchedulerError::invalid_state(
                "add_tasks() on a completed scheduler",
            ));
        }

        let first = inner.results.len();
        let mut indices = Vec::with_capacity(inputs.len());
        for (offset, data) in inputs.into_iter().enumerate() {
            let index = first + offset;
            inner.results.push(None);
            inner.failures.push(FailureLog::default());
            inner.queue.push_back(Task::new(data, index));
            indices.push(index);
        }

        debug!("Added {} tasks (indices from {})", indices.len(), first);

        self.shared.admit(&mut inner);
        Ok(indices)
    }

    /// Re-submit tasks after a completed run, typically its `error_tasks`
    ///
    /// Each re-submitted task gets a full retry budget. Its previous result is
    /// discarded and it is removed from `error_tasks` until it settles again.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidState`] if `run()` was never called or the
    ///   previous run has not completed, or a task index is unknown
    /// - the same run errors as [`Scheduler::run`]
    pub async fn retry_tasks(&self, tasks: Vec<Task<T>>) -> Result<RunReport<T, R>> {
        let rx = {
            let mut inner = self.shared.lock();
            if inner.cleared {
                return Err(SchedulerError::Cleared);
            }
            if inner.executor.is_none() {
                return Err(SchedulerError::invalid_state(
                    "retry_tasks() before run()",
                ));
            }
            if inner.state != TaskState::Completed {
                return Err(SchedulerError::invalid_state(
                    "retry_tasks() while a run is in progress",
                ));
            }
            if tasks.iter().any(|task| task.index >= inner.results.len()) {
                return Err(SchedulerError::invalid_state(
                    "retry_tasks() with an unknown task index",
                ));
            }

            let mut seen = HashSet::new();
            for task in tasks {
                if !seen.insert(task.index) {
                    continue;
                }
                if inner.results[task.index].take().is_some() {
                    inner.settled -= 1;
                }
                inner.failures[task.index] = FailureLog::default();
                inner.queue.push_back(task);
            }
            inner.error_tasks.retain(|task| !seen.contains(&task.index));

            info!("Retrying {} tasks", inner.queue.len());

            inner.state = TaskState::Running;
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);

            self.shared.admit(&mut inner);
            rx
        };

        rx.await.unwrap_or(Err(SchedulerError::Cleared))
    }

    /// Tear everything down
    ///
    /// Cancels in-flight work, empties the queue and marks the scheduler
    /// completed. Pending `run()`/`retry_tasks()` futures resolve with
    /// [`SchedulerError::Cleared`]; no further progress callbacks fire.
    pub fn clear(&self) {
        let mut inner = self.shared.lock();

        inner.state = TaskState::Completed;
        inner.cleared = true;
        inner.progress = None;
        for flight in std::mem::take(&mut inner.in_flight).into_values() {
            flight.cancel.cancel();
        }
        inner.queue.clear();
        inner.waiter = None;
        drop(inner);

        // Let a callback that already started finish before returning
        drop(self.shared.notify_guard());

        info!("Scheduler cleared");
    }

    /// Register the progress callback, replacing any previous one
    ///
    /// Called with the cumulative number of settled tasks (success or final
    /// failure) after each settlement, outside the scheduler lock. The
    /// callback must not call [`Scheduler::clear`], which waits for it.
    pub fn on_progress_change<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.shared.lock().progress = Some(Arc::new(callback));
    }

    /// Current scheduler state
    pub fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    /// Number of settled tasks
    pub fn progress(&self) -> usize {
        self.shared.lock().settled
    }

    /// Total number of tasks known to the scheduler
    pub fn total(&self) -> usize {
        self.shared.lock().results.len()
    }

    /// Number of admitted attempt chains
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Number of queued tasks
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }
}

impl<T, R> Shared<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Inner<T, R>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_guard(&self) -> MutexGuard<'_, ()> {
        self.notify.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission: fill free slots from the head of the queue, or complete the
    /// run once nothing is left
    fn admit(self: &Arc<Self>, inner: &mut Inner<T, R>) {
        if inner.state != TaskState::Running {
            return;
        }
        let (Some(executor), Some(runtime)) = (inner.executor.clone(), inner.runtime.clone())
        else {
            return;
        };

        while inner.in_flight.len() < self.config.max_concurrent_tasks {
            let Some(task) = inner.queue.pop_front() else {
                break;
            };

            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            let cancel = CancelSignal::new();

            debug!("Admitting task {} (ticket {})", task.index, ticket);
            inner.in_flight.insert(
                task.index,
                InFlight {
                    task: task.clone(),
                    cancel: cancel.clone(),
                    ticket,
                },
            );

            runtime.spawn(Arc::clone(self).drive(task, cancel, ticket, Arc::clone(&executor)));
        }

        if inner.queue.is_empty() && inner.in_flight.is_empty() {
            inner.state = TaskState::Completed;

            let report = RunReport {
                results: inner
                    .results
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Err(TaskError::Cancelled)))
                    .collect(),
                error_tasks: inner.error_tasks.clone(),
            };

            info!(
                "Scheduler run completed ({} succeeded, {} failed)",
                report.succeeded(),
                report.error_tasks.len()
            );

            if let Some(waiter) = inner.waiter.take() {
                let _ = waiter.send(Ok(report));
            }
        }
    }

    /// Execute one task with retries until it settles or is abandoned
    async fn drive(
        self: Arc<Self>,
        task: Task<T>,
        cancel: CancelSignal,
        ticket: u64,
        executor: ExecutorFn<T, R>,
    ) {
        let index = task.index;

        loop {
            // Failures survive pause and resume, so a requeued task may
            // already be out of attempts
            if let Some(err) = self.exhausted(index) {
                debug!("Task {} has no attempts left ({})", index, err);
                self.settle(index, ticket, Err(err));
                return;
            }

            let attempt = tokio::spawn(executor(task.data.clone(), cancel.clone()));
            let outcome = match attempt.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(TaskError::fatal("executor panicked")),
                Err(_) => Err(TaskError::Cancelled),
            };

            let err = match outcome {
                Ok(value) => {
                    self.settle(index, ticket, Ok(value));
                    return;
                }
                Err(err) => err,
            };

            // A real failure counts even if a pause lands right after it
            let failures = if err.is_cancelled() {
                0
            } else {
                self.record_failure(index, &err)
            };

            if cancel.is_cancelled() {
                debug!("Task {} attempt cancelled ({}), abandoning", index, err);
                return;
            }

            let retries = failures.saturating_sub(1);
            if !err.is_retryable() || retries >= self.config.max_retries {
                if err.is_retryable() {
                    error!("Task {} failed after {} retries: {}", index, retries, err);
                } else {
                    error!("Task {} failed permanently: {}", index, err);
                }
                self.settle(index, ticket, Err(err));
                return;
            }

            if !self.is_current(index, ticket) {
                return;
            }

            let delay = self.config.retry_delay_for(failures);
            warn!(
                "Task {} attempt failed ({}), retry {}/{} in {:?}",
                index, err, failures, self.config.max_retries, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Task {} retry wait aborted", index);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.is_current(index, ticket) {
                return;
            }
        }
    }

    /// Count a real failed attempt of `index`, returning its failures so far
    ///
    /// Only `retry_tasks()` resets the count.
    fn record_failure(&self, index: usize, err: &TaskError) -> u32 {
        let mut inner = self.lock();
        match inner.failures.get_mut(index) {
            Some(log) => {
                log.count += 1;
                log.last = Some(err.clone());
                log.count
            }
            None => 0,
        }
    }

    /// Final error of `index` if it may not be attempted again
    fn exhausted(&self, index: usize) -> Option<TaskError> {
        let inner = self.lock();
        let log = inner.failures.get(index)?;
        let last = log.last.as_ref()?;
        (!last.is_retryable() || log.count > self.config.max_retries).then(|| last.clone())
    }

    fn is_current(&self, index: usize, ticket: u64) -> bool {
        let inner = self.lock();
        inner.state == TaskState::Running
            && inner.in_flight.get(&index).map(|f| f.ticket) == Some(ticket)
    }

    /// Record the final outcome of an attempt chain and re-enter admission
    fn settle(
        self: &Arc<Self>,
        index: usize,
        ticket: u64,
        outcome: std::result::Result<R, TaskError>,
    ) {
        let (progress, settled) = {
            let mut inner = self.lock();

            let flight = match inner.in_flight.remove(&index) {
                Some(flight) if flight.ticket == ticket => flight,
                other => {
                    if let Some(newer) = other {
                        inner.in_flight.insert(index, newer);
                    }
                    warn!("Discarding stale result for task {} (ticket {})", index, ticket);
                    return;
                }
            };

            if outcome.is_err() {
                inner.error_tasks.push(flight.task);
            }
            inner.results[index] = Some(outcome);
            inner.settled += 1;

            if let Some(budget) = self.config.error_budget {
                let failed = inner.error_tasks.len();
                if failed > budget {
                    self.abort_over_budget(&mut inner, failed, budget);
                    return;
                }
            }

            (inner.progress.clone(), inner.settled)
        };

        if let Some(progress) = progress {
            let _gate = self.notify_guard();
            if !self.lock().cleared {
                progress(settled);
            }
        }

        let mut inner = self.lock();
        self.admit(&mut inner);
    }

    fn abort_over_budget(&self, inner: &mut Inner<T, R>, failed: usize, budget: usize) {
        error!(
            "Error budget exceeded ({} failed, budget {}), aborting run",
            failed, budget
        );

        inner.state = TaskState::Completed;
        for flight in std::mem::take(&mut inner.in_flight).into_values() {
            flight.cancel.cancel();
        }
        inner.queue.clear();

        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(Err(SchedulerError::ErrorBudgetExceeded { failed, budget }));
        }
    }
}
