//! Exchange connectivity.
//!
//! REST for account state and orders, WebSocket for market data. The rest
//! of the pipeline only sees the `ExchangeClient` trait; whether orders hit
//! Binance or the in-memory simulator is decided once, at wiring time.

mod client;
pub mod mock;
pub mod stream;
mod traits;
mod types;
mod websocket;

pub use client::BinanceClient;
pub use mock::MockExchangeClient;
pub use stream::StreamManager;
pub use traits::ExchangeClient;
pub use types::*;
pub use websocket::ws_base_url;
