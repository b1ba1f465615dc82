//! Pipeline error taxonomy.
//!
//! Connectivity and validation errors are counted and the pipeline continues;
//! rate-limit and circuit-open errors fail fast with a hint; execution errors
//! leave a partially executed trade that requires manual reconciliation.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Socket or REST failure. Retried with backoff up to a bound, then
    /// surfaced as a fatal stream-batch failure.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Malformed or out-of-range quote/opportunity data. The single record
    /// is dropped and counted.
    #[error("validation error: {0}")]
    Validation(String),

    /// Request budget exhausted for the current window.
    #[error("rate limit exceeded for {scope}:{key}, retry after {retry_after:?}")]
    RateLimited {
        key: String,
        scope: String,
        retry_after: Duration,
    },

    /// The protecting circuit breaker is open; the call was not attempted.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The exchange rejected an order mid-trade. Remaining legs are not
    /// attempted and not reversed; manual reconciliation is required.
    #[error("execution error on {symbol}: {reason}")]
    Execution { symbol: String, reason: String },
}

impl PipelineError {
    /// Whether the error stops only the current record, not the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::RateLimited { .. }
                | PipelineError::CircuitOpen(_)
        )
    }
}
