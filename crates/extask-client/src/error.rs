//! Error types for the lease client.

use extask_core::TaskId;
use thiserror::Error;

/// Errors returned by broker calls.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The request was rejected locally before reaching the broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level failure: connection refused, DNS, timeout.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The broker answered with a non-success status.
    #[error("broker error: HTTP {status}: {body}")]
    BrokerError { status: u16, body: String },

    /// The broker no longer considers this worker the lease holder.
    #[error("lease lost for task {task_id}: {reason}")]
    LeaseLost { task_id: TaskId, reason: String },

    /// A success response whose body could not be decoded.
    #[error("failed to decode broker response: {0}")]
    Decode(String),
}

impl LeaseError {
    /// Returns true for connectivity failures (the broker never answered).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::BrokerUnreachable(_))
    }

    /// Returns true when the broker rejected the caller as lease holder.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// Whether repeating the same report call could succeed.
    ///
    /// Only transport failures and 5xx answers qualify; a lost lease or a
    /// 4xx is authoritative.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BrokerUnreachable(_) => true,
            Self::BrokerError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LeaseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if err.is_builder() {
            // Malformed URL or body: sending again cannot help.
            Self::InvalidRequest(err.to_string())
        } else {
            Self::BrokerUnreachable(err.to_string())
        }
    }
}
