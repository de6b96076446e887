//! Runs a handler against one leased task within the lease window.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use extask_core::{TaskLease, TaskOutcome};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::{HandlerRegistry, TaskContext};

/// Executes handlers so that every invocation yields exactly one outcome.
///
/// - The handler runs on its own task; a panic becomes a technical error.
/// - The handler may use the lease time minus `report_margin`; running past
///   that is a technical error, reported while the lease is still held.
/// - On shutdown the handler is signalled through its context and gets
///   `shutdown_grace` (bounded by the budget) before it is aborted.
pub struct TaskExecutor {
    handlers: Arc<HandlerRegistry>,
    report_margin: Duration,
    shutdown_grace: Duration,
}

impl TaskExecutor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        report_margin: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            handlers,
            report_margin,
            shutdown_grace,
        }
    }

    /// Process one lease.
    pub async fn run(&self, lease: &TaskLease, shutdown: &CancellationToken) -> TaskOutcome {
        let Some(budget) = lease.processing_budget(Utc::now(), self.report_margin) else {
            warn!(
                task_id = %lease.task_id,
                lock_expiry = %lease.lock_expiry,
                "Lease expired before processing started"
            );
            return TaskOutcome::technical("lease expired before processing started");
        };

        let Some(handler) = self.handlers.get(&lease.topic) else {
            return TaskOutcome::technical(format!(
                "no handler registered for topic '{}'",
                lease.topic
            ));
        };

        let deadline = Instant::now() + budget;
        let ctx = TaskContext::new(lease.clone(), shutdown.child_token());
        let mut join = tokio::spawn(async move { handler.handle(&ctx).await });

        debug!(task_id = %lease.task_id, budget_ms = budget.as_millis() as u64, "Handler started");

        tokio::select! {
            result = &mut join => outcome_from_join(result),
            _ = tokio::time::sleep_until(deadline) => {
                join.abort();
                TaskOutcome::technical("processing exceeded lease budget").with_details(format!(
                    "handler still running after {} ms; lease expires at {}",
                    budget.as_millis(),
                    lease.lock_expiry
                ))
            }
            _ = shutdown.cancelled() => {
                let left = deadline.saturating_duration_since(Instant::now());
                let grace = self.shutdown_grace.min(left);
                match tokio::time::timeout(grace, &mut join).await {
                    Ok(result) => outcome_from_join(result),
                    Err(_) => {
                        join.abort();
                        TaskOutcome::technical("interrupted by shutdown")
                    }
                }
            }
        }
    }
}

fn outcome_from_join(result: Result<TaskOutcome, JoinError>) -> TaskOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic());
            TaskOutcome::technical("handler panicked").with_details(message)
        }
        Err(_) => TaskOutcome::technical("handler task was cancelled"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
