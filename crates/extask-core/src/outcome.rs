//! Task outcomes: what came out of processing one leased task.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classification of an outcome, used for logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    BusinessFailure,
    TechnicalError,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BusinessFailure => "business_failure",
            Self::TechnicalError => "technical_error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of processing one leased task.
///
/// Ephemeral: produced by the executor, consumed by the reporter, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Processing succeeded. `variables` are handed back to the broker
    /// alongside the result.
    Success {
        result: Value,
        variables: Map<String, Value>,
    },

    /// An expected, domain-level failure the broker may retry.
    BusinessFailure {
        message: String,
        details: String,
        retry_timeout: Option<Duration>,
    },

    /// The worker itself misbehaved: handler panic, timeout, missing handler.
    TechnicalError {
        message: String,
        details: Option<String>,
    },
}

impl TaskOutcome {
    /// Success carrying `result`.
    pub fn success(result: impl Into<Value>) -> Self {
        Self::Success {
            result: result.into(),
            variables: Map::new(),
        }
    }

    /// Business failure with a message and details.
    pub fn business_failure(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::BusinessFailure {
            message: message.into(),
            details: details.into(),
            retry_timeout: None,
        }
    }

    /// Technical error with a message.
    pub fn technical(message: impl Into<String>) -> Self {
        Self::TechnicalError {
            message: message.into(),
            details: None,
        }
    }

    /// Builder method to add an output variable to a success.
    /// No-op on failures.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Self::Success { variables, .. } = &mut self {
            variables.insert(name.into(), value.into());
        }
        self
    }

    /// Builder method to request a retry delay on a business failure.
    /// No-op on other variants.
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        if let Self::BusinessFailure { retry_timeout, .. } = &mut self {
            *retry_timeout = Some(timeout);
        }
        self
    }

    /// Builder method to attach details to a technical error.
    /// No-op on other variants.
    pub fn with_details(mut self, text: impl Into<String>) -> Self {
        if let Self::TechnicalError { details, .. } = &mut self {
            *details = Some(text.into());
        }
        self
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success { .. } => OutcomeKind::Success,
            Self::BusinessFailure { .. } => OutcomeKind::BusinessFailure,
            Self::TechnicalError { .. } => OutcomeKind::TechnicalError,
        }
    }

    /// Returns true for both failure variants.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success { .. })
    }
}
