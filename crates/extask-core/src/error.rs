//! Core domain errors.

use thiserror::Error;

/// Core domain errors for extask.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid backoff configuration.
    #[error("Invalid backoff policy: {0}")]
    InvalidBackoff(String),
}
