//! Worker errors.

use std::time::Duration;

use extask_core::{CoreError, Topic};
use thiserror::Error;

/// Configuration problems detected before the loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one topic must be configured")]
    NoTopics,

    #[error("lock duration must be at least 1ms")]
    ZeroLockDuration,

    #[error("report margin ({margin:?}) must be shorter than the lock duration ({lock:?})")]
    MarginTooLarge { margin: Duration, lock: Duration },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("error backoff ({error:?}) must not be shorter than idle backoff ({idle:?})")]
    ErrorBackoffTooShort { error: Duration, idle: Duration },

    #[error("duplicate handler for topic '{0}'")]
    DuplicateHandler(Topic),

    #[error("no handler registered for topic '{0}'")]
    MissingHandler(Topic),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Reasons a poll loop stops other than cancellation.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The broker request could never succeed as configured.
    #[error("fetch-and-lock rejected locally: {0}")]
    InvalidRequest(String),

    /// The loop's task panicked or was aborted.
    #[error("poll loop task failed: {0}")]
    Join(String),
}
