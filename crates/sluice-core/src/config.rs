//! Scheduler configuration

use crate::error::{Result, SchedulerError};
use std::time::Duration;

/// Upper bound for the default concurrency derived from the CPU count
pub const MAX_DEFAULT_CONCURRENCY: usize = 16;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of tasks admitted at the same time
    pub max_concurrent_tasks: usize,

    /// Retries after the first failed attempt (executor runs at most `max_retries + 1` times)
    pub max_retries: u32,

    /// Delay before the first retry
    pub retry_delay: Duration,

    /// Multiplier applied to the delay for each further retry (1.0 = constant)
    pub backoff_multiplier: f64,

    /// Cap for the computed retry delay
    pub max_retry_delay: Duration,

    /// Abort the run once more than this many tasks failed permanently
    pub error_budget: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_concurrency(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(30),
            error_budget: None,
        }
    }
}

/// Hardware parallelism, clamped to `1..=MAX_DEFAULT_CONCURRENCY`
#[must_use]
pub fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_CONCURRENCY)
}

impl SchedulerConfig {
    /// Set the concurrency cap
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the retry count
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set exponential backoff parameters
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_retry_delay = max_delay;
        self
    }

    /// Set the hard error budget
    #[must_use]
    pub fn with_error_budget(mut self, budget: usize) -> Self {
        self.error_budget = Some(budget);
        self
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] if the concurrency cap is zero
    /// or the backoff multiplier is not a finite value `>= 1.0`.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::invalid_config(
                "max_concurrent_tasks must be at least 1",
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SchedulerError::invalid_config(
                "backoff_multiplier must be a finite value >= 1.0",
            ));
        }

        Ok(())
    }

    /// Delay to wait before retry number `retry` (1-based)
    #[must_use]
    pub fn retry_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.retry_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_retry_delay.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }
}
