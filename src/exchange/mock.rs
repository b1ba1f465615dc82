//! Simulated exchange client for paper trading and tests.
//!
//! Implements the same `ExchangeClient` trait as the live client: fills
//! every order at its requested price, keeps in-memory balances, and can be
//! scripted to reject orders for specific symbols.

use crate::exchange::traits::ExchangeClient;
use crate::exchange::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

pub struct MockExchangeClient {
    symbols: Vec<SymbolInfo>,
    balances: RwLock<HashMap<String, Decimal>>,
    fail_symbols: RwLock<HashSet<String>>,
    orders: RwLock<Vec<NewOrder>>,
    order_id: AtomicI64,
    fee_rate: Decimal,
}

impl MockExchangeClient {
    pub fn new(fee_rate: Decimal) -> Self {
        Self {
            symbols: Vec::new(),
            balances: RwLock::new(HashMap::new()),
            fail_symbols: RwLock::new(HashSet::new()),
            orders: RwLock::new(Vec::new()),
            order_id: AtomicI64::new(1),
            fee_rate,
        }
    }

    /// Register a tradable symbol with its quantization rules.
    pub fn with_symbol(
        mut self,
        symbol: &str,
        base_asset: &str,
        quote_asset: &str,
        step_size: Decimal,
        min_qty: Decimal,
        min_notional: Decimal,
    ) -> Self {
        self.symbols.push(SymbolInfo {
            symbol: symbol.to_string(),
            status: "TRADING".to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            filters: vec![
                SymbolFilter::LotSize {
                    min_qty,
                    max_qty: Decimal::new(9_999_999, 0),
                    step_size,
                },
                SymbolFilter::MinNotional { min_notional },
                SymbolFilter::PriceFilter {
                    tick_size: Decimal::new(1, 8),
                },
            ],
        });
        self
    }

    /// Adopt a symbol universe wholesale, e.g. real exchange info in
    /// simulation mode.
    pub fn with_symbols(mut self, symbols: Vec<SymbolInfo>) -> Self {
        self.symbols.extend(symbols);
        self
    }

    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances
            .write()
            .await
            .insert(asset.to_string(), amount);
    }

    pub async fn balance_of(&self, asset: &str) -> Decimal {
        self.balances
            .read()
            .await
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Script the next orders for `symbol` to be rejected.
    pub async fn fail_orders_for(&self, symbol: &str) {
        self.fail_symbols.write().await.insert(symbol.to_string());
    }

    /// All orders placed so far, in order.
    pub async fn orders_placed(&self) -> Vec<NewOrder> {
        self.orders.read().await.clone()
    }

    fn symbol_info(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_exchange_info(&self) -> Result<Vec<SymbolInfo>> {
        Ok(self.symbols.clone())
    }

    async fn get_balances(&self) -> Result<Vec<AccountBalance>> {
        let balances = self.balances.read().await;
        Ok(balances
            .iter()
            .map(|(asset, free)| AccountBalance {
                asset: asset.clone(),
                free: *free,
                locked: Decimal::ZERO,
            })
            .collect())
    }

    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse> {
        if self.fail_symbols.read().await.contains(&order.symbol) {
            return Err(anyhow!("exchange rejected order for {}", order.symbol));
        }

        let info = self
            .symbol_info(&order.symbol)
            .ok_or_else(|| anyhow!("unknown symbol {}", order.symbol))?;
        let price = order
            .price
            .ok_or_else(|| anyhow!("mock client only fills limit orders"))?;

        let base = info.base_asset.clone();
        let quote = info.quote_asset.clone();
        let fee_keep = Decimal::ONE - self.fee_rate;

        {
            let mut balances = self.balances.write().await;
            match order.side {
                OrderSide::Buy => {
                    let cost = order.quantity * price;
                    let available = balances.get(&quote).copied().unwrap_or(Decimal::ZERO);
                    if available < cost {
                        return Err(anyhow!(
                            "insufficient {} balance: have {}, need {}",
                            quote,
                            available,
                            cost
                        ));
                    }
                    *balances.entry(quote).or_insert(Decimal::ZERO) -= cost;
                    *balances.entry(base).or_insert(Decimal::ZERO) += order.quantity * fee_keep;
                }
                OrderSide::Sell => {
                    let available = balances.get(&base).copied().unwrap_or(Decimal::ZERO);
                    if available < order.quantity {
                        return Err(anyhow!(
                            "insufficient {} balance: have {}, need {}",
                            base,
                            available,
                            order.quantity
                        ));
                    }
                    *balances.entry(base).or_insert(Decimal::ZERO) -= order.quantity;
                    *balances.entry(quote).or_insert(Decimal::ZERO) +=
                        order.quantity * price * fee_keep;
                }
            }
        }

        self.orders.write().await.push(order.clone());
        let order_id = self.order_id.fetch_add(1, Ordering::SeqCst);

        info!(
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.quantity,
            %price,
            order_id,
            "Simulated fill"
        );

        Ok(OrderResponse {
            order_id,
            symbol: order.symbol.clone(),
            status: OrderStatus::Filled,
            price,
            orig_qty: order.quantity,
            executed_qty: order.quantity,
            side: order.side,
            transact_time: Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> MockExchangeClient {
        MockExchangeClient::new(dec!(0.001)).with_symbol(
            "ETHBTC",
            "ETH",
            "BTC",
            dec!(0.0001),
            dec!(0.0001),
            dec!(0.0001),
        )
    }

    fn order(side: OrderSide, qty: Decimal, price: Decimal) -> NewOrder {
        NewOrder {
            symbol: "ETHBTC".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: qty,
            price: Some(price),
            time_in_force: Some(TimeInForce::Ioc),
        }
    }

    #[tokio::test]
    async fn test_buy_moves_balances_with_fee() {
        let client = client();
        client.set_balance("BTC", dec!(1)).await;

        let response = client
            .place_order(&order(OrderSide::Buy, dec!(2), dec!(0.05)))
            .await
            .unwrap();

        assert_eq!(response.status, OrderStatus::Filled);
        assert_eq!(client.balance_of("BTC").await, dec!(0.9));
        assert_eq!(client.balance_of("ETH").await, dec!(1.998));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let client = client();
        client.set_balance("BTC", dec!(0.01)).await;

        let result = client
            .place_order(&order(OrderSide::Buy, dec!(2), dec!(0.05)))
            .await;
        assert!(result.is_err());
        assert!(client.orders_placed().await.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let client = client();
        client.set_balance("BTC", dec!(1)).await;
        client.fail_orders_for("ETHBTC").await;

        let result = client
            .place_order(&order(OrderSide::Buy, dec!(1), dec!(0.05)))
            .await;
        assert!(result.is_err());
        // Balance untouched by the rejected order
        assert_eq!(client.balance_of("BTC").await, dec!(1));
    }
}
