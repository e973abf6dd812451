//! service-core: plumbing shared by the chat backends.
//!
//! Configuration bootstrap, the HTTP error type, tracing setup with W3C
//! trace-context propagation for outbound calls, and the request-id and
//! request-metrics middleware.

pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
