//! Worker configuration.

use std::time::Duration;

use extask_core::{BackoffPolicy, Topic, WorkerId};

use crate::error::ConfigError;
use crate::reporter::RetryBudget;

/// Configuration of one poll loop (one worker identity and topic set).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity presented to the broker.
    pub worker_id: WorkerId,

    /// Topics this worker subscribes to.
    pub topics: Vec<Topic>,

    /// Lock duration requested on every fetch.
    pub lock_duration: Duration,

    /// Upper bound of tasks claimed per fetch.
    pub max_tasks: u32,

    /// Tasks processed at the same time.
    pub max_concurrency: usize,

    /// Delay after a poll that returned nothing.
    pub idle_backoff: BackoffPolicy,

    /// Delay after a poll that failed.
    pub error_backoff: BackoffPolicy,

    /// Lease time reserved for the outcome call.
    pub report_margin: Duration,

    /// Retry hints sent with failure reports.
    pub retry: RetryBudget,

    /// Attempts per outcome call when the broker is unreachable.
    pub report_attempts: u32,

    /// Pause between outcome call attempts.
    pub report_retry_delay: Duration,

    /// How long in-flight handlers may keep running after a stop signal.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    /// Configuration with defaults for the given identity and topics.
    pub fn new(worker_id: WorkerId, topics: Vec<Topic>) -> Self {
        Self {
            worker_id,
            topics,
            ..Self::default()
        }
    }

    /// Builder method to set the lock duration.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Builder method to set the per-fetch and concurrency limits.
    pub fn with_limits(mut self, max_tasks: u32, max_concurrency: usize) -> Self {
        self.max_tasks = max_tasks;
        self.max_concurrency = max_concurrency;
        self
    }

    /// Builder method to set both backoff policies.
    pub fn with_backoff(mut self, idle: BackoffPolicy, error: BackoffPolicy) -> Self {
        self.idle_backoff = idle;
        self.error_backoff = error;
        self
    }

    /// Builder method to set the reporting margin.
    pub fn with_report_margin(mut self, margin: Duration) -> Self {
        self.report_margin = margin;
        self
    }

    /// Check the configuration can drive a poll loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.lock_duration.as_millis() == 0 {
            return Err(ConfigError::ZeroLockDuration);
        }
        if self.report_margin >= self.lock_duration {
            return Err(ConfigError::MarginTooLarge {
                margin: self.report_margin,
                lock: self.lock_duration,
            });
        }
        if self.max_tasks == 0 {
            return Err(ConfigError::Zero("max_tasks"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Zero("max_concurrency"));
        }
        if self.report_attempts == 0 {
            return Err(ConfigError::Zero("report_attempts"));
        }

        self.idle_backoff.validate()?;
        self.error_backoff.validate()?;
        self.retry.retry_backoff.validate()?;

        let idle = self.idle_backoff.ceiling();
        let error = self.error_backoff.ceiling();
        if error < idle {
            return Err(ConfigError::ErrorBackoffTooShort { error, idle });
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            topics: Vec::new(),
            lock_duration: Duration::from_secs(10),
            max_tasks: 1,
            max_concurrency: 4,
            idle_backoff: BackoffPolicy::fixed(Duration::from_secs(2)),
            error_backoff: BackoffPolicy::exponential(
                Duration::from_secs(5),
                2.0,
                Duration::from_secs(60),
            )
            .with_jitter(0.2),
            report_margin: Duration::from_secs(2),
            retry: RetryBudget::default(),
            report_attempts: 3,
            report_retry_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
