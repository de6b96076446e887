//! Reports task outcomes back to the broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use extask_client::{FailureReport, LeaseClient, LeaseError};
use extask_core::{BackoffPolicy, TaskLease, TaskOutcome};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::metrics::WorkerMetrics;

const UNSPECIFIED_ERROR: &str = "unspecified error";
const TECHNICAL_PREFIX: &str = "[technical]";

/// Retry hints attached to failure reports.
///
/// The broker owns the retry counter; these values only matter when it does
/// not send one with the lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Retries to request when the lease carries no countdown.
    pub default_retries: u32,

    /// Delay before the broker hands a failed task out again.
    pub retry_backoff: BackoffPolicy,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            default_retries: 0,
            retry_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryBudget {
    /// Retries left after this failure.
    pub fn retries_for(&self, lease: &TaskLease) -> u32 {
        match lease.retries_remaining {
            Some(remaining) => remaining.saturating_sub(1),
            None => self.default_retries,
        }
    }

    /// Delay the broker should wait before retrying. Never zero.
    ///
    /// The backoff attempt is `default_retries - retries + 1`: the first
    /// failure uses the policy's first step, and each retry the broker's
    /// countdown consumes below `default_retries` moves one step further.
    /// A countdown at or above `default_retries` stays on the first step.
    pub fn timeout_for(&self, lease: &TaskLease, requested: Option<Duration>) -> Duration {
        let timeout = requested.unwrap_or_else(|| {
            let attempt = self
                .default_retries
                .saturating_sub(self.retries_for(lease))
                .saturating_add(1);
            self.retry_backoff.delay(attempt)
        });
        timeout.max(Duration::from_millis(1))
    }
}

/// What happened to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// The broker accepted the completion.
    Completed,
    /// The broker accepted the failure report.
    FailureReported,
    /// The lease was gone; the outcome was dropped.
    LeaseLost,
    /// The broker never acknowledged the outcome.
    ReportFailed,
}

/// Turns outcomes into complete/failure calls.
pub struct OutcomeReporter {
    client: Arc<dyn LeaseClient>,
    budget: RetryBudget,
    attempts: u32,
    retry_delay: Duration,
    metrics: Arc<WorkerMetrics>,
}

impl OutcomeReporter {
    pub fn new(
        client: Arc<dyn LeaseClient>,
        budget: RetryBudget,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            client,
            budget,
            attempts: 3,
            retry_delay: Duration::from_millis(200),
            metrics,
        }
    }

    /// Builder method to set how often an unanswered call is repeated.
    pub fn with_attempts(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Report one outcome. Never fails: every error class is logged and
    /// counted here.
    pub async fn report(&self, lease: &TaskLease, outcome: TaskOutcome) -> ReportStatus {
        // The broker may already have handed the task to another worker.
        if lease.is_expired(Utc::now()) {
            self.metrics.record_lease_lost();
            warn!(
                task_id = %lease.task_id,
                lock_expiry = %lease.lock_expiry,
                outcome = %outcome.kind(),
                "Lease expired before the outcome could be reported; dropping it"
            );
            return ReportStatus::LeaseLost;
        }

        match outcome {
            TaskOutcome::Success { result, variables } => {
                let client = &self.client;
                let sent = self
                    .send(lease, "complete", || {
                        client.complete(&lease.task_id, &lease.worker_id, &result, &variables)
                    })
                    .await;
                match sent {
                    Ok(()) => {
                        self.metrics.record_completed();
                        info!(task_id = %lease.task_id, topic = %lease.topic, "Task completed");
                        ReportStatus::Completed
                    }
                    Err(err) => self.on_report_error(lease, "complete", err),
                }
            }
            TaskOutcome::BusinessFailure {
                message,
                details,
                retry_timeout,
            } => {
                self.metrics.record_business_failure();
                info!(
                    task_id = %lease.task_id,
                    topic = %lease.topic,
                    error = %message,
                    "Task failed"
                );
                let report = self.failure_report(lease, message, details, retry_timeout);
                self.report_failure(lease, report).await
            }
            TaskOutcome::TechnicalError { message, details } => {
                self.metrics.record_technical_error();
                warn!(
                    task_id = %lease.task_id,
                    topic = %lease.topic,
                    technical = true,
                    error = %message,
                    details = details.as_deref().unwrap_or(""),
                    "Task hit a technical error"
                );
                let details = match details {
                    Some(d) if !d.is_empty() => format!("{TECHNICAL_PREFIX} {d}"),
                    _ => TECHNICAL_PREFIX.to_string(),
                };
                let report = self.failure_report(lease, message, details, None);
                self.report_failure(lease, report).await
            }
        }
    }

    fn failure_report(
        &self,
        lease: &TaskLease,
        message: String,
        details: String,
        retry_timeout: Option<Duration>,
    ) -> FailureReport {
        let error_message = if message.trim().is_empty() {
            UNSPECIFIED_ERROR.to_string()
        } else {
            message
        };
        FailureReport {
            task_id: lease.task_id.clone(),
            worker_id: lease.worker_id.clone(),
            error_message,
            error_details: details,
            retries: self.budget.retries_for(lease),
            retry_timeout: self.budget.timeout_for(lease, retry_timeout),
        }
    }

    async fn report_failure(&self, lease: &TaskLease, report: FailureReport) -> ReportStatus {
        let client = &self.client;
        match self
            .send(lease, "failure", || client.report_failure(&report))
            .await
        {
            Ok(()) => {
                self.metrics.record_failure_reported();
                info!(
                    task_id = %lease.task_id,
                    retries = report.retries,
                    retry_timeout_ms = report.retry_timeout.as_millis() as u64,
                    "Failure reported"
                );
                ReportStatus::FailureReported
            }
            Err(err) => self.on_report_error(lease, "failure", err),
        }
    }

    /// Issue `call`, repeating it while the broker could not be reached and
    /// the lease still has time left.
    async fn send<F, Fut>(
        &self,
        lease: &TaskLease,
        operation: &'static str,
        mut call: F,
    ) -> Result<(), LeaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), LeaseError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.is_retryable()
                        && attempt < self.attempts
                        && lease.remaining(Utc::now()) > self.retry_delay =>
                {
                    warn!(
                        task_id = %lease.task_id,
                        operation,
                        attempt,
                        error = %err,
                        "Outcome call failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn on_report_error(&self, lease: &TaskLease, operation: &str, err: LeaseError) -> ReportStatus {
        if err.is_lease_lost() {
            self.metrics.record_lease_lost();
            warn!(
                task_id = %lease.task_id,
                operation,
                error = %err,
                "Lease lost before the outcome was reported; dropping it"
            );
            return ReportStatus::LeaseLost;
        }

        self.metrics.record_report_failure();
        error!(
            task_id = %lease.task_id,
            operation,
            report_failed = true,
            error = %err,
            "Broker did not accept the outcome; the task will be handed out again after lock expiry"
        );
        ReportStatus::ReportFailed
    }
}
