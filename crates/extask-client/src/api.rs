//! The lease client seam.

use std::time::Duration;

use async_trait::async_trait;
use extask_core::{TaskId, TaskLease, Topic, WorkerId};
use serde_json::{Map, Value};

use crate::error::LeaseError;

/// Parameters of one fetch-and-lock call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub worker_id: WorkerId,
    pub topics: Vec<Topic>,
    pub lock_duration: Duration,
    pub max_tasks: u32,
}

impl FetchRequest {
    /// Reject requests the broker could never satisfy.
    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.topics.is_empty() {
            return Err(LeaseError::InvalidRequest(
                "at least one topic is required".into(),
            ));
        }
        if self.lock_duration.as_millis() == 0 {
            return Err(LeaseError::InvalidRequest(
                "lock duration must be at least 1ms".into(),
            ));
        }
        if self.max_tasks == 0 {
            return Err(LeaseError::InvalidRequest(
                "max_tasks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A failure report for one leased task.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub error_message: String,
    pub error_details: String,
    /// Worker-side hint of retries left; the broker's own counter wins.
    pub retries: u32,
    pub retry_timeout: Duration,
}

/// The three broker operations a worker needs.
///
/// Implementations must be safe to share between concurrently running task
/// dispatches.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Claim up to `max_tasks` pending tasks. An empty vector means the broker
    /// had nothing to hand out, which is not an error.
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<TaskLease>, LeaseError>;

    /// Report successful processing.
    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &Value,
        variables: &Map<String, Value>,
    ) -> Result<(), LeaseError>;

    /// Report failed processing; the broker decides between retry and incident.
    async fn report_failure(&self, report: &FailureReport) -> Result<(), LeaseError>;
}
