//! Pluggable business logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use extask_core::{TaskLease, TaskOutcome, Topic};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// What a handler sees of the task it processes.
pub struct TaskContext {
    lease: TaskLease,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(lease: TaskLease, cancel: CancellationToken) -> Self {
        Self { lease, cancel }
    }

    pub fn lease(&self) -> &TaskLease {
        &self.lease
    }

    /// Read a task variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.lease.variable(name)
    }

    /// Returns true once the worker is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the worker is shutting down. Long-running handlers should
    /// select on this and wrap up.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Business logic for the tasks of one or more topics.
///
/// Handlers return an outcome rather than an error: a failure of the business
/// operation is a [`TaskOutcome::BusinessFailure`]. Panics are caught by the
/// executor and turned into technical errors.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> TaskOutcome;
}

/// Topic to handler mapping.
///
/// Built during initialization, read-only while the loop runs.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Topic, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a topic.
    pub fn register(
        &mut self,
        topic: Topic,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), ConfigError> {
        if self.handlers.contains_key(&topic) {
            return Err(ConfigError::DuplicateHandler(topic));
        }
        self.handlers.insert(topic, handler);
        Ok(())
    }

    /// Handler used for topics without a dedicated one.
    pub fn with_fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, topic: &Topic) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(topic)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Fail fast when a subscribed topic could never be handled.
    pub fn ensure_covers(&self, topics: &[Topic]) -> Result<(), ConfigError> {
        if self.fallback.is_some() {
            return Ok(());
        }
        match topics.iter().find(|t| !self.handlers.contains_key(*t)) {
            Some(missing) => Err(ConfigError::MissingHandler(missing.clone())),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

/// Completes every task with its own variables as the result.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, ctx: &TaskContext) -> TaskOutcome {
        TaskOutcome::success(Value::Object(ctx.lease().payload.clone()))
    }
}
