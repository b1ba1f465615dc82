//! # Triarb
//!
//! Real-time triangular arbitrage detection and execution on Binance.
//!
//! ## Architecture
//!
//! - `config`: Immutable configuration, loaded once at startup
//! - `error`: Pipeline error taxonomy
//! - `exchange`: Exchange connectivity (REST + WebSocket + stream manager)
//! - `market`: Concurrent price cache with staleness eviction
//! - `strategy`: Opportunity detection, validation/scoring, and trade execution
//! - `resilience`: Circuit breaker and sliding-window rate limiter
//! - `persistence`: Append-only SQLite audit log of terminal records
//! - `metrics`: Pipeline performance counters
//! - `utils`: Shared decimal arithmetic helpers

pub mod config;
pub mod error;
pub mod exchange;
pub mod market;
pub mod metrics;
pub mod persistence;
pub mod resilience;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::PipelineError;
