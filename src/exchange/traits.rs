//! Exchange-agnostic client capability set.
//!
//! The whole pipeline talks to the exchange through this one trait, so a
//! simulated client, a testnet client, or another venue is a new
//! implementation rather than a fork of the pipeline.

use crate::exchange::types::{AccountBalance, NewOrder, OrderResponse, SymbolInfo};
use async_trait::async_trait;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Cheap connectivity probe.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Symbol universe with trading rules (status, lot-size, min-notional).
    /// Fetched once at startup and periodically refreshed.
    async fn get_exchange_info(&self) -> anyhow::Result<Vec<SymbolInfo>>;

    /// Free/locked balances per asset.
    async fn get_balances(&self) -> anyhow::Result<Vec<AccountBalance>>;

    /// Place an order. The one side-effecting call in the pipeline.
    async fn place_order(&self, order: &NewOrder) -> anyhow::Result<OrderResponse>;
}
