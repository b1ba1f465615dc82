//! Sequential execution of a validated triangle.
//!
//! Legs run strictly in order; each one re-checks the balance, quantizes
//! the quantity to the symbol's lot rules, and prices the order with a
//! slippage buffer. A failed leg ends the trade where it stands: partial
//! fills are never unwound automatically, they are logged for manual
//! reconciliation.

use crate::config::ExecutionConfig;
use crate::exchange::{
    ExchangeClient, NewOrder, OrderSide, OrderType, SymbolInfo, TimeInForce,
};
use crate::metrics::PipelineMetrics;
use crate::persistence::HistoryStore;
use crate::strategy::detector::{Leg, Opportunity};
use crate::utils::decimal::{rate_to_profit_pct, round_down_to_lot, round_to_tick, safe_div};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Lifecycle of one triangle trade. Legs are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    Pending,
    ExecutingLeg(u8),
    Completed,
    Failed,
    /// Aborted with legs remaining by the stop-loss floor
    Stopped,
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeState::Pending => write!(f, "PENDING"),
            TradeState::ExecutingLeg(n) => write!(f, "EXECUTING_LEG_{n}"),
            TradeState::Completed => write!(f, "COMPLETED"),
            TradeState::Failed => write!(f, "FAILED"),
            TradeState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A filled leg of a trade.
#[derive(Debug, Clone)]
pub struct TradeStep {
    pub leg: u8,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub order_id: i64,
    pub executed_qty: Decimal,
}

/// Record of one attempted triangle.
#[derive(Debug, Clone)]
pub struct Trade {
    pub base: String,
    pub route: String,
    pub state: TradeState,
    pub steps: Vec<TradeStep>,
    pub initial_amount: Decimal,
    pub final_amount: Option<Decimal>,
    pub realized_profit_pct: Option<Decimal>,
    pub failure_reason: Option<String>,
    /// Milliseconds since epoch
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl Trade {
    fn new(opportunity: &Opportunity, initial_amount: Decimal) -> Self {
        Self {
            base: opportunity.base.clone(),
            route: opportunity.route_signature(),
            state: TradeState::Pending,
            steps: Vec::with_capacity(3),
            initial_amount,
            final_amount: None,
            realized_profit_pct: None,
            failure_reason: None,
            started_at: Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }
}

/// Turns opportunities into orders through one `ExchangeClient`.
pub struct Executor {
    client: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    fee_rate: Decimal,
    // Replaced wholesale on metadata refresh, read per leg
    symbols: RwLock<HashMap<String, SymbolInfo>>,
    store: Option<Arc<HistoryStore>>,
    metrics: Arc<PipelineMetrics>,
}

impl Executor {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        fee_rate: Decimal,
        symbols: Vec<SymbolInfo>,
        store: Option<Arc<HistoryStore>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            client,
            config,
            fee_rate,
            symbols: RwLock::new(symbols.into_iter().map(|s| (s.symbol.clone(), s)).collect()),
            store,
            metrics,
        }
    }

    /// Swap in a refreshed symbol table. Trades planned after this call see
    /// the new statuses and filters.
    pub fn update_symbols(&self, symbols: Vec<SymbolInfo>) {
        let table = symbols.into_iter().map(|s| (s.symbol.clone(), s)).collect();
        *self.symbols.write().expect("symbol table lock poisoned") = table;
    }

    fn symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols
            .read()
            .expect("symbol table lock poisoned")
            .get(symbol)
            .cloned()
    }

    /// Execute all three legs. Always returns the trade record; an `Err`
    /// would mean losing track of what already filled, so leg failures
    /// end in a terminal state instead.
    #[instrument(skip(self, opportunity), fields(route = %opportunity.route_signature()))]
    pub async fn execute(&self, opportunity: &Opportunity) -> Trade {
        let initial = self.config.trade_amount;
        let floor = initial * (Decimal::ONE - self.config.stop_loss_pct);
        let mut trade = Trade::new(opportunity, initial);
        let mut running = initial;

        info!(
            base = %opportunity.base,
            expected_profit_pct = %opportunity.profit_pct,
            amount = %initial,
            "Executing triangle"
        );

        for (i, leg) in opportunity.legs.iter().enumerate() {
            let leg_no = i as u8 + 1;
            trade.state = TradeState::ExecutingLeg(leg_no);

            let order = match self.plan_leg(leg, running) {
                Ok(order) => order,
                Err(reason) => return self.fail(trade, reason),
            };
            if let Err(reason) = self.check_balance(&order).await {
                return self.fail(trade, reason);
            }

            let response = match tokio::time::timeout(
                Duration::from_secs(self.config.order_timeout_secs),
                self.client.place_order(&order),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return self.fail(trade, format!("leg {leg_no} order failed: {e:#}"));
                }
                Err(_) => {
                    return self.fail(
                        trade,
                        format!(
                            "leg {leg_no} order timed out after {}s",
                            self.config.order_timeout_secs
                        ),
                    );
                }
            };

            let fee_keep = Decimal::ONE - self.fee_rate;
            running = match order.side {
                OrderSide::Buy => response.executed_qty * fee_keep,
                OrderSide::Sell => response.executed_qty * response.price * fee_keep,
            };

            trade.steps.push(TradeStep {
                leg: leg_no,
                symbol: response.symbol,
                side: response.side,
                quantity: response.orig_qty,
                price: response.price,
                order_id: response.order_id,
                executed_qty: response.executed_qty,
            });

            // Project the remaining legs at planned rates; below the floor
            // we keep what we hold rather than finish a losing cycle. A
            // fully filled route is complete wherever it landed.
            let remaining = &opportunity.legs[i + 1..];
            if !remaining.is_empty() {
                let projected: Decimal =
                    remaining.iter().fold(running, |amount, leg| amount * leg.rate);
                if projected < floor {
                    warn!(
                        leg = leg_no,
                        %projected,
                        %floor,
                        "Stop-loss floor breached, halting route"
                    );
                    trade.state = TradeState::Stopped;
                    trade.finished_at = Some(Utc::now().timestamp_millis());
                    self.metrics.trade_stopped();
                    self.persist(&trade);
                    return trade;
                }
            }
        }

        trade.state = TradeState::Completed;
        trade.final_amount = Some(running);
        trade.realized_profit_pct = Some(rate_to_profit_pct(safe_div(running, initial)));
        trade.finished_at = Some(Utc::now().timestamp_millis());

        info!(
            final_amount = %running,
            realized_profit_pct = %trade.realized_profit_pct.unwrap_or_default(),
            "Triangle completed"
        );
        self.metrics.trade_completed();
        self.persist(&trade);
        trade
    }

    /// Size and price one leg from the running amount. The running amount
    /// is denominated in the leg's spend currency: the market quote asset
    /// for a buy, the base asset for a sell.
    fn plan_leg(&self, leg: &Leg, running: Decimal) -> Result<NewOrder, String> {
        let info = self
            .symbol_info(&leg.symbol)
            .ok_or_else(|| format!("{}: unknown symbol", leg.symbol))?;
        if !info.is_trading() {
            return Err(format!("{}: not trading", leg.symbol));
        }

        let buffer = self.config.slippage_buffer;
        let tick = info.tick_size();
        let (price, raw_qty) = match leg.side {
            // Pay up slightly to keep the IOC order marketable
            OrderSide::Buy => {
                let price = round_to_tick(leg.price * (Decimal::ONE + buffer), tick);
                (price, safe_div(running, price))
            }
            OrderSide::Sell => (round_to_tick(leg.price * (Decimal::ONE - buffer), tick), running),
        };

        let lot = info.lot_size();
        let qty = round_down_to_lot(raw_qty, lot.step_size).min(lot.max_qty);
        if qty < lot.min_qty {
            return Err(format!(
                "{}: quantity {qty} below lot minimum {}",
                leg.symbol, lot.min_qty
            ));
        }
        if qty * price < info.min_notional() {
            return Err(format!(
                "{}: notional {} below minimum {}",
                leg.symbol,
                qty * price,
                info.min_notional()
            ));
        }

        Ok(NewOrder {
            symbol: leg.symbol.clone(),
            side: leg.side,
            order_type: OrderType::Limit,
            quantity: qty,
            price: Some(price),
            time_in_force: Some(TimeInForce::Ioc),
        })
    }

    async fn check_balance(&self, order: &NewOrder) -> Result<(), String> {
        let info = self
            .symbol_info(&order.symbol)
            .ok_or_else(|| format!("{}: unknown symbol", order.symbol))?;
        let (asset, needed) = match order.side {
            OrderSide::Buy => (
                info.quote_asset.as_str(),
                order.quantity * order.price.unwrap_or_default(),
            ),
            OrderSide::Sell => (info.base_asset.as_str(), order.quantity),
        };

        let balances = self
            .client
            .get_balances()
            .await
            .map_err(|e| format!("balance query failed: {e:#}"))?;
        let free = balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO);

        if free < needed {
            return Err(format!(
                "insufficient {asset} balance: have {free}, need {needed}"
            ));
        }
        Ok(())
    }

    fn fail(&self, mut trade: Trade, reason: String) -> Trade {
        if trade.steps.is_empty() {
            warn!(route = %trade.route, "Trade aborted before any fill: {reason}");
        } else {
            error!(
                route = %trade.route,
                filled_legs = trade.steps.len(),
                "Trade failed mid-route, manual reconciliation required: {reason}"
            );
        }
        trade.state = TradeState::Failed;
        trade.failure_reason = Some(reason);
        trade.finished_at = Some(Utc::now().timestamp_millis());
        self.metrics.trade_failed();
        self.persist(&trade);
        trade
    }

    fn persist(&self, trade: &Trade) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_trade(trade) {
                warn!("Failed to persist trade: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchangeClient, SymbolFilter};
    use rust_decimal_macros::dec;

    fn mock_client() -> MockExchangeClient {
        MockExchangeClient::new(dec!(0.001))
            .with_symbol("ETHUSDT", "ETH", "USDT", dec!(0.0001), dec!(0.0001), dec!(0.001))
            .with_symbol("ETHBTC", "ETH", "BTC", dec!(0.0001), dec!(0.0001), dec!(0.000001))
            .with_symbol("BTCUSDT", "BTC", "USDT", dec!(0.00001), dec!(0.00001), dec!(0.001))
    }

    fn opportunity() -> Opportunity {
        let fee_keep = dec!(0.999);
        let leg = |symbol: &str, side: OrderSide, price: Decimal| Leg {
            symbol: symbol.to_string(),
            side,
            price,
            available_qty: dec!(100),
            spread: dec!(0.0001),
            rate: match side {
                OrderSide::Buy => fee_keep / price,
                OrderSide::Sell => price * fee_keep,
            },
        };
        let legs = vec![
            leg("ETHUSDT", OrderSide::Buy, dec!(2001)),
            leg("ETHBTC", OrderSide::Sell, dec!(0.0672)),
            leg("BTCUSDT", OrderSide::Sell, dec!(30000)),
        ];
        let net_rate: Decimal = legs.iter().map(|l| l.rate).product();
        Opportunity {
            base: "USDT".to_string(),
            legs,
            net_rate,
            profit_pct: rate_to_profit_pct(net_rate),
            min_leg_volume: dec!(100),
            max_leg_spread: dec!(0.0001),
            detected_at: Utc::now().timestamp_millis(),
        }
    }

    async fn executor(client: MockExchangeClient, trade_amount: Decimal) -> Executor {
        let symbols = client.get_exchange_info().await.unwrap();
        Executor::new(
            Arc::new(client),
            ExecutionConfig {
                trade_amount,
                ..ExecutionConfig::default()
            },
            dec!(0.001),
            symbols,
            None,
            Arc::new(PipelineMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_profitable_route_completes() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;
        let executor = executor(client, dec!(100)).await;

        let trade = executor.execute(&opportunity()).await;

        assert_eq!(trade.state, TradeState::Completed);
        assert_eq!(trade.steps.len(), 3);
        assert_eq!(trade.steps[0].side, OrderSide::Buy);
        let final_amount = trade.final_amount.unwrap();
        // Quantization eats into the theoretical 0.45% edge
        assert!(final_amount > dec!(99) && final_amount < dec!(101));
        assert!(trade.realized_profit_pct.is_some());
        assert_eq!(executor.metrics.snapshot().trades_completed, 1);
    }

    #[tokio::test]
    async fn test_mid_route_failure_stops_without_unwinding() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;
        client.fail_orders_for("ETHBTC").await;
        let executor = executor(client, dec!(100)).await;

        let trade = executor.execute(&opportunity()).await;

        assert_eq!(trade.state, TradeState::Failed);
        // The first leg filled and stays filled
        assert_eq!(trade.steps.len(), 1);
        assert_eq!(trade.steps[0].symbol, "ETHUSDT");
        assert!(trade.failure_reason.unwrap().contains("leg 2"));
        assert_eq!(executor.metrics.snapshot().trades_failed, 1);
    }

    #[tokio::test]
    async fn test_third_leg_never_placed_after_second_fails() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;
        client.fail_orders_for("ETHBTC").await;

        let symbols = client.get_exchange_info().await.unwrap();
        let client = Arc::new(client);
        let executor = Executor::new(
            Arc::clone(&client) as Arc<dyn ExchangeClient>,
            ExecutionConfig {
                trade_amount: dec!(100),
                ..ExecutionConfig::default()
            },
            dec!(0.001),
            symbols,
            None,
            Arc::new(PipelineMetrics::new()),
        );

        executor.execute(&opportunity()).await;

        let orders = client.orders_placed().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_before_ordering() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1)).await;
        let executor = executor(client, dec!(100)).await;

        let trade = executor.execute(&opportunity()).await;

        assert_eq!(trade.state, TradeState::Failed);
        assert!(trade.steps.is_empty());
        assert!(trade.failure_reason.unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn test_stop_loss_halts_after_quantization_loss() {
        // A coarse lot grid on the first leg forces a fill far below the
        // planned amount, breaching the 1% floor immediately
        let client = MockExchangeClient::new(dec!(0.001))
            .with_symbol("AAAUSDT", "AAA", "USDT", dec!(40), dec!(40), dec!(0.001))
            .with_symbol("AAABBB", "AAA", "BBB", dec!(0.0001), dec!(0.0001), dec!(0.000001))
            .with_symbol("BBBUSDT", "BBB", "USDT", dec!(0.0001), dec!(0.0001), dec!(0.001));
        client.set_balance("USDT", dec!(1000)).await;

        let mut opp = opportunity();
        opp.legs[0] = Leg {
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(1),
            available_qty: dec!(1000),
            spread: dec!(0.0001),
            rate: dec!(0.999),
        };
        opp.legs[1].symbol = "AAABBB".to_string();
        opp.legs[1].price = dec!(1);
        opp.legs[1].rate = dec!(1);
        opp.legs[2].symbol = "BBBUSDT".to_string();
        opp.legs[2].price = dec!(1);
        opp.legs[2].rate = dec!(1);

        let executor = executor(client, dec!(100)).await;
        let trade = executor.execute(&opp).await;

        // 100 USDT buys 99.95 AAA pre-lot but only 80 on a 40-lot grid
        assert_eq!(trade.state, TradeState::Stopped);
        assert_eq!(trade.steps.len(), 1);
        assert_eq!(executor.metrics.snapshot().trades_stopped, 1);
    }

    #[tokio::test]
    async fn test_fully_filled_route_below_floor_completes_with_loss() {
        // Planned rates promise a gain, fills deliver a loss: all three
        // legs execute, so the trade is complete, not stopped
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;

        let symbols = client.get_exchange_info().await.unwrap();
        let executor = Executor::new(
            Arc::new(client),
            ExecutionConfig {
                trade_amount: dec!(100),
                stop_loss_pct: dec!(0.001),
                ..ExecutionConfig::default()
            },
            dec!(0.001),
            symbols,
            None,
            Arc::new(PipelineMetrics::new()),
        );

        let mut opp = opportunity();
        for leg in &mut opp.legs {
            leg.price = dec!(1);
            leg.rate = dec!(1.01);
        }

        let trade = executor.execute(&opp).await;

        assert_eq!(trade.state, TradeState::Completed);
        assert_eq!(trade.steps.len(), 3);
        let final_amount = trade.final_amount.unwrap();
        // Fees and slippage buffers land well under the 99.9 floor
        assert!(final_amount < dec!(99.9) && final_amount > dec!(99));
        assert!(trade.realized_profit_pct.unwrap() < Decimal::ZERO);
        assert_eq!(executor.metrics.snapshot().trades_completed, 1);
        assert_eq!(executor.metrics.snapshot().trades_stopped, 0);
    }

    #[tokio::test]
    async fn test_limit_price_snapped_to_tick_grid() {
        let info = SymbolInfo {
            symbol: "AAAUSDT".to_string(),
            status: "TRADING".to_string(),
            base_asset: "AAA".to_string(),
            quote_asset: "USDT".to_string(),
            filters: vec![
                SymbolFilter::LotSize {
                    min_qty: dec!(0.01),
                    max_qty: dec!(9999999),
                    step_size: dec!(0.01),
                },
                SymbolFilter::MinNotional {
                    min_notional: dec!(0.001),
                },
                SymbolFilter::PriceFilter {
                    tick_size: dec!(0.01),
                },
            ],
        };
        let executor = Executor::new(
            Arc::new(MockExchangeClient::new(dec!(0.001))),
            ExecutionConfig {
                trade_amount: dec!(100),
                ..ExecutionConfig::default()
            },
            dec!(0.001),
            vec![info],
            None,
            Arc::new(PipelineMetrics::new()),
        );

        let leg = Leg {
            symbol: "AAAUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(1),
            available_qty: dec!(1000),
            spread: dec!(0.0001),
            rate: dec!(0.999),
        };
        let order = executor.plan_leg(&leg, dec!(100)).unwrap();

        // 1 * 1.0005 snaps back onto the 0.01 tick grid
        assert_eq!(order.price, Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_symbol_update_applies_to_subsequent_trades() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;
        let symbols = client.get_exchange_info().await.unwrap();
        let executor = executor(client, dec!(100)).await;

        let trade = executor.execute(&opportunity()).await;
        assert_eq!(trade.state, TradeState::Completed);

        // ETHBTC suspended on refresh
        let updated: Vec<SymbolInfo> = symbols
            .into_iter()
            .map(|mut s| {
                if s.symbol == "ETHBTC" {
                    s.status = "BREAK".to_string();
                }
                s
            })
            .collect();
        executor.update_symbols(updated);

        let trade = executor.execute(&opportunity()).await;
        assert_eq!(trade.state, TradeState::Failed);
        assert_eq!(trade.steps.len(), 1);
        assert!(trade.failure_reason.unwrap().contains("not trading"));
    }

    #[tokio::test]
    async fn test_below_lot_minimum_rejected_up_front() {
        let client = mock_client();
        client.set_balance("USDT", dec!(1000)).await;
        let executor = executor(client, dec!(0.01)).await;

        let trade = executor.execute(&opportunity()).await;

        assert_eq!(trade.state, TradeState::Failed);
        assert!(trade.steps.is_empty());
        assert!(trade.failure_reason.unwrap().contains("lot minimum"));
    }
}
