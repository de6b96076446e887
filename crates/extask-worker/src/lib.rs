//! extask worker: polls the broker for external tasks, runs the registered
//! handler within the lease window and reports the outcome.
//!
//! The moving parts, bottom-up:
//! - [`TaskExecutor`] turns one lease into exactly one [`TaskOutcome`].
//! - [`OutcomeReporter`] sends that outcome to the broker.
//! - [`PollLoop`] claims work while there is capacity and dispatches it.
//! - [`WorkerPool`] runs several loops in one process.
//!
//! [`TaskOutcome`]: extask_core::TaskOutcome

pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod reporter;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use error::{ConfigError, WorkerError};
pub use executor::TaskExecutor;
pub use handler::{EchoHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use pool::{MetricsSource, WorkerPool};
pub use reporter::{OutcomeReporter, ReportStatus, RetryBudget};
pub use scheduler::{PollLoop, RunSummary};
