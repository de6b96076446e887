//! HTTP implementation of the lease client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extask_core::{TaskId, TaskLease, Topic, WorkerId};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::api::{FailureReport, FetchRequest, LeaseClient};
use crate::dto::{CompleteBody, FailureBody, FetchAndLockBody, LockedTaskDto};
use crate::error::LeaseError;

/// Timeouts and paths for [`HttpLeaseClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Timeout of complete/failure calls.
    pub request_timeout: Duration,
    /// How long the broker may hold a fetch-and-lock call open.
    pub long_poll_timeout: Duration,
    /// Path of the health check, relative to the base URL.
    pub health_path: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            long_poll_timeout: Duration::from_secs(30),
            health_path: "/health".to_string(),
        }
    }
}

/// Lease client speaking the broker's REST contract.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct HttpLeaseClient {
    inner: reqwest::Client,
    base_url: String,
    config: HttpClientConfig,
}

impl HttpLeaseClient {
    /// Create a new client for a broker API rooted at `base_url`
    /// (e.g. `http://localhost:5601/abada/api/v1`).
    pub fn new(base_url: &str) -> Self {
        Self::with_config(base_url, HttpClientConfig::default())
    }

    /// Create a client with explicit timeouts.
    pub fn with_config(base_url: &str, config: HttpClientConfig) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the broker answers its health check.
    pub async fn health(&self) -> Result<bool, LeaseError> {
        let url = format!("{}{}", self.base_url, self.config.health_path);
        debug!(url = %url, "Checking broker health");

        let response = self
            .inner
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<(StatusCode, String), LeaseError> {
        debug!(url = %url, "POST request");
        let response = self
            .inner
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    fn task_url(&self, task_id: &TaskId, action: &str) -> String {
        format!(
            "{}/external-tasks/{}/{}",
            self.base_url,
            task_id.as_str(),
            action
        )
    }
}

#[async_trait]
impl LeaseClient for HttpLeaseClient {
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<TaskLease>, LeaseError> {
        request.validate()?;

        let body = FetchAndLockBody {
            worker_id: request.worker_id.as_str(),
            topics: request.topics.iter().map(Topic::as_str).collect(),
            lock_duration: request.lock_duration.as_millis() as u64,
            max_tasks: request.max_tasks,
        };
        let url = format!("{}/external-tasks/fetch-and-lock", self.base_url);

        // Taken before sending so the computed expiry never overshoots the
        // broker's.
        let locked_at = Utc::now();
        let timeout = self.config.long_poll_timeout + self.config.request_timeout;
        let (status, text) = self.post(&url, &body, timeout).await?;

        if !status.is_success() {
            return Err(LeaseError::BrokerError {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tasks: Vec<LockedTaskDto> =
            serde_json::from_str(&text).map_err(|e| LeaseError::Decode(e.to_string()))?;

        Ok(tasks
            .into_iter()
            .map(|dto| into_lease(dto, &request.worker_id, locked_at, request.lock_duration))
            .collect())
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &Value,
        variables: &Map<String, Value>,
    ) -> Result<(), LeaseError> {
        let mut variables = variables.clone();
        variables.remove("workerId");
        variables.remove("workerResult");
        let body = CompleteBody {
            worker_id: worker_id.as_str(),
            worker_result: result,
            variables,
        };

        let url = self.task_url(task_id, "complete");
        let (status, text) = self.post(&url, &body, self.config.request_timeout).await?;
        classify_report_response(task_id, status, &text)
    }

    async fn report_failure(&self, report: &FailureReport) -> Result<(), LeaseError> {
        let body = FailureBody {
            worker_id: report.worker_id.as_str(),
            error_message: &report.error_message,
            error_details: &report.error_details,
            retries: report.retries,
            retry_timeout: report.retry_timeout.as_millis() as u64,
        };

        let url = self.task_url(&report.task_id, "failure");
        let (status, text) = self.post(&url, &body, self.config.request_timeout).await?;
        classify_report_response(&report.task_id, status, &text)
    }
}

/// Turn a fetched task into a lease.
///
/// The expiry is the earlier of what the broker reported and what the worker
/// computed from its own clock, so clock skew can only shorten the budget.
fn into_lease(
    dto: LockedTaskDto,
    worker_id: &WorkerId,
    locked_at: DateTime<Utc>,
    lock_duration: Duration,
) -> TaskLease {
    let mut lease = TaskLease::new(
        TaskId::new(dto.id),
        worker_id.clone(),
        Topic::new(dto.topic_name),
        locked_at,
        lock_duration,
    )
    .with_payload(dto.variables.unwrap_or_default());

    // The broker's expiry wins: a long poll may lock the task well after the
    // request was sent. Without one, request time plus duration is the safe
    // lower bound.
    if let Some(reported) = dto.lock_expiration_time.and_then(|t| t.to_datetime()) {
        lease = lease.with_expiry(reported);
    }
    if let Some(retries) = dto.retries {
        lease = lease.with_retries(retries);
    }
    lease
}

/// Map the answer to a complete/failure call onto the lease error taxonomy.
///
/// - 404, 409, 410 and 423 mean the caller is no longer the lease holder.
/// - A 2xx carrying an `error` field is a rejection dressed as success.
/// - A 5xx saying the task was "not found" is how some brokers report a task
///   that already moved on.
pub(crate) fn classify_report_response(
    task_id: &TaskId,
    status: StatusCode,
    body: &str,
) -> Result<(), LeaseError> {
    let lease_lost = |reason: String| LeaseError::LeaseLost {
        task_id: task_id.clone(),
        reason,
    };

    if status.is_success() {
        return match error_field(body) {
            Some(reason) => Err(lease_lost(reason)),
            None => Ok(()),
        };
    }

    let code = status.as_u16();
    match code {
        404 | 409 | 410 | 423 => Err(lease_lost(format!("HTTP {code}: {body}"))),
        500..=599 if body.to_ascii_lowercase().contains("not found") => {
            Err(lease_lost(format!("HTTP {code}: {body}")))
        }
        _ => Err(LeaseError::BrokerError {
            status: code,
            body: body.to_string(),
        }),
    }
}

fn error_field(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
