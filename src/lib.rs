//! A client-side request cache.
//!
//! Queries are identified by an [`cache::Endpoint`] plus structured params.
//! The cache serves fresh data without a network call, coalesces concurrent
//! requests for the same query into one transport call, retries failures
//! with a constant delay, and lets callers invalidate groups of entries by
//! tag. [`client::QueryClient`] is the entry point.

pub mod cache;
pub mod client;
pub mod error;
pub mod net;

pub use client::{DataMutation, QueryClient, QueryHandle, QueryView};
pub use error::{Error, Result};

/// Default user agent for `querycache` - automatically uses the package version
///
/// Can be overridden via the `QUERYCACHE_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
