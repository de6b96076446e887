//! In-memory broker for worker tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extask_client::{FailureReport, FetchRequest, LeaseClient, LeaseError};
use extask_core::{TaskId, TaskLease, Topic, WorkerId};
use serde_json::{Map, Value};

/// A completion the broker accepted.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub result: Value,
    pub variables: Map<String, Value>,
}

struct Pending {
    task_id: TaskId,
    topic: Topic,
    payload: Map<String, Value>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Pending>,
    locks: HashMap<TaskId, (WorkerId, DateTime<Utc>)>,
    completions: Vec<Completion>,
    failures: Vec<FailureReport>,
    fetch_calls: u32,
    complete_calls: u32,
    failure_calls: u32,
    fetch_errors: VecDeque<LeaseError>,
    complete_errors: VecDeque<LeaseError>,
    failure_errors: VecDeque<LeaseError>,
    backdate: Option<chrono::Duration>,
}

/// Hands each pending task to at most one worker and only accepts outcomes
/// from the current, unexpired lock holder.
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<State>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn push_task(&self, task_id: &str, topic: &str) {
        self.push_task_with(task_id, topic, Map::new());
    }

    pub fn push_task_with(&self, task_id: &str, topic: &str, payload: Map<String, Value>) {
        self.state().pending.push_back(Pending {
            task_id: TaskId::new(task_id),
            topic: Topic::new(topic),
            payload,
        });
    }

    /// Lock a task for `worker_id` directly, bypassing fetch-and-lock.
    pub fn claim(
        &self,
        task_id: TaskId,
        topic: Topic,
        worker_id: WorkerId,
        lock_duration: Duration,
    ) -> TaskLease {
        let lease = TaskLease::new(task_id, worker_id, topic, Utc::now(), lock_duration);
        self.state().locks.insert(
            lease.task_id.clone(),
            (lease.worker_id.clone(), lease.lock_expiry),
        );
        lease
    }

    /// Hand out leases as if they had been locked `by` ago.
    pub fn backdate_locks(&self, by: Duration) {
        self.state().backdate = chrono::Duration::from_std(by).ok();
    }

    pub fn fail_next_fetch(&self, err: LeaseError) {
        self.state().fetch_errors.push_back(err);
    }

    pub fn fail_next_complete(&self, err: LeaseError) {
        self.state().complete_errors.push_back(err);
    }

    pub fn fail_next_failure(&self, err: LeaseError) {
        self.state().failure_errors.push_back(err);
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.state().completions.clone()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        self.state().failures.clone()
    }

    pub fn fetch_calls(&self) -> u32 {
        self.state().fetch_calls
    }

    pub fn complete_calls(&self) -> u32 {
        self.state().complete_calls
    }

    pub fn failure_calls(&self) -> u32 {
        self.state().failure_calls
    }

    /// Tasks not yet handed out.
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    fn release(state: &mut State, task_id: &TaskId, worker_id: &WorkerId) -> Result<(), LeaseError> {
        match state.locks.get(task_id) {
            Some((holder, expiry)) if holder == worker_id && Utc::now() < *expiry => {
                state.locks.remove(task_id);
                Ok(())
            }
            _ => Err(LeaseError::LeaseLost {
                task_id: task_id.clone(),
                reason: "not locked by this worker".into(),
            }),
        }
    }
}

#[async_trait]
impl LeaseClient for FakeBroker {
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<TaskLease>, LeaseError> {
        request.validate()?;
        let mut state = self.state();
        state.fetch_calls += 1;
        if let Some(err) = state.fetch_errors.pop_front() {
            return Err(err);
        }

        let locked_at = match state.backdate {
            Some(by) => Utc::now() - by,
            None => Utc::now(),
        };
        let mut leases = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(task) = state.pending.pop_front() {
            if leases.len() < request.max_tasks as usize && request.topics.contains(&task.topic) {
                let lease = TaskLease::new(
                    task.task_id,
                    request.worker_id.clone(),
                    task.topic,
                    locked_at,
                    request.lock_duration,
                )
                .with_payload(task.payload);
                leases.push(lease);
            } else {
                remaining.push_back(task);
            }
        }
        state.pending = remaining;
        for lease in &leases {
            state.locks.insert(
                lease.task_id.clone(),
                (lease.worker_id.clone(), lease.lock_expiry),
            );
        }
        Ok(leases)
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &Value,
        variables: &Map<String, Value>,
    ) -> Result<(), LeaseError> {
        let mut state = self.state();
        state.complete_calls += 1;
        if let Some(err) = state.complete_errors.pop_front() {
            return Err(err);
        }
        Self::release(&mut state, task_id, worker_id)?;
        state.completions.push(Completion {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            result: result.clone(),
            variables: variables.clone(),
        });
        Ok(())
    }

    async fn report_failure(&self, report: &FailureReport) -> Result<(), LeaseError> {
        let mut state = self.state();
        state.failure_calls += 1;
        if let Some(err) = state.failure_errors.pop_front() {
            return Err(err);
        }
        Self::release(&mut state, &report.task_id, &report.worker_id)?;
        state.failures.push(report.clone());
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
