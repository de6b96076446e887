//! Lease client for the external task broker.
//!
//! Wraps the three broker operations (fetch-and-lock, complete, failure) as
//! typed calls. [`LeaseClient`] is the seam the worker depends on;
//! [`HttpLeaseClient`] speaks the broker's REST contract.

pub mod api;
pub mod dto;
pub mod error;
pub mod http;

pub use api::{FailureReport, FetchRequest, LeaseClient};
pub use error::LeaseError;
pub use http::{HttpClientConfig, HttpLeaseClient};
