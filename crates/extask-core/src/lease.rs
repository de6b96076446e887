//! Task leases: a worker's time-bounded, exclusive claim on one task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{TaskId, Topic, WorkerId};

/// A worker's temporary, exclusive claim on one external task.
///
/// Created by a successful fetch-and-lock call and ended either by an explicit
/// complete/failure report or by silent expiry at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLease {
    /// Broker-assigned task identifier.
    pub task_id: TaskId,

    /// Worker holding the lease.
    pub worker_id: WorkerId,

    /// Topic the task was fetched from.
    pub topic: Topic,

    /// When the fetch-and-lock request was issued.
    pub locked_at: DateTime<Utc>,

    /// Instant after which the broker may hand the task to someone else.
    pub lock_expiry: DateTime<Utc>,

    /// Broker-side retry countdown, when the broker reports one.
    pub retries_remaining: Option<u32>,

    /// Task variables handed out by the broker.
    pub payload: Map<String, Value>,
}

impl TaskLease {
    /// Create a lease locked at `locked_at` for `lock_duration`.
    pub fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        topic: Topic,
        locked_at: DateTime<Utc>,
        lock_duration: Duration,
    ) -> Self {
        let lock_expiry = locked_at
            + chrono::Duration::from_std(lock_duration).unwrap_or(chrono::Duration::zero());
        Self {
            task_id,
            worker_id,
            topic,
            locked_at,
            lock_expiry,
            retries_remaining: None,
            payload: Map::new(),
        }
    }

    /// Builder method to override the expiry reported by the broker.
    pub fn with_expiry(mut self, lock_expiry: DateTime<Utc>) -> Self {
        self.lock_expiry = lock_expiry;
        self
    }

    /// Builder method to set the broker's retry countdown.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = Some(retries);
        self
    }

    /// Builder method to set the task variables.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.lock_expiry - now).to_std().unwrap_or_default()
    }

    /// Returns true once the broker may reassign the task.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lock_expiry
    }

    /// Wall-clock time the handler may use while still leaving `margin` for
    /// the outcome call. `None` when nothing is left.
    pub fn processing_budget(&self, now: DateTime<Utc>, margin: Duration) -> Option<Duration> {
        let remaining = self.remaining(now);
        if remaining <= margin {
            None
        } else {
            Some(remaining - margin)
        }
    }

    /// Read a task variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}
