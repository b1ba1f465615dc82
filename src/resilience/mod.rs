//! Resilience primitives protecting the pipeline from cascading failure.
//!
//! Both are explicit wrapper objects composed around a call site, so
//! composition order and failure propagation stay visible where the call
//! is made.

mod circuit;
mod rate_limit;

pub use circuit::{CircuitBreaker, CircuitState};
pub use rate_limit::{RateLimiter, ScopeLimit};
