//! extask Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - The async runtime
//!
//! All types here describe the worker side of the external task lease
//! lifecycle: who holds a lease, until when, and what came out of processing.

pub mod backoff;
pub mod error;
pub mod ids;
pub mod lease;
pub mod outcome;
pub mod status;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use error::CoreError;
pub use ids::{TaskId, Topic, WorkerId};
pub use lease::TaskLease;
pub use outcome::{OutcomeKind, TaskOutcome};
pub use status::WorkerState;
