//! Type definitions for exchange API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange information (symbol universe and trading rules).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

/// Trading pair metadata with order filters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Order filters. Only the filters the executor needs are modeled; the
/// rest deserialize into `Other` and are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(other)]
    Other,
}

/// Lot-size rules extracted from symbol filters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotSizeRules {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
}

impl Default for LotSizeRules {
    fn default() -> Self {
        // Conservative fallback when the exchange omits the filter
        Self {
            min_qty: Decimal::new(1, 5),
            max_qty: Decimal::new(9_999_999, 0),
            step_size: Decimal::new(1, 5),
        }
    }
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }

    pub fn lot_size(&self) -> LotSizeRules {
        for filter in &self.filters {
            if let SymbolFilter::LotSize {
                min_qty,
                max_qty,
                step_size,
            } = filter
            {
                return LotSizeRules {
                    min_qty: *min_qty,
                    max_qty: *max_qty,
                    step_size: *step_size,
                };
            }
        }
        LotSizeRules::default()
    }

    pub fn min_notional(&self) -> Decimal {
        for filter in &self.filters {
            match filter {
                SymbolFilter::MinNotional { min_notional }
                | SymbolFilter::Notional { min_notional } => return *min_notional,
                _ => {}
            }
        }
        Decimal::new(10, 0)
    }

    /// Price grid step, 1e-8 when the exchange omits the filter.
    pub fn tick_size(&self) -> Decimal {
        for filter in &self.filters {
            if let SymbolFilter::PriceFilter { tick_size } = filter {
                return *tick_size;
            }
        }
        Decimal::new(1, 8)
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
}

/// Order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    pub transact_time: i64,
}

/// Account balance for one asset.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// Top-of-book frame from a `@bookTicker` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b", with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(rename = "B", with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(rename = "a", with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(rename = "A", with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
    /// Event time; the spot stream omits it, futures streams carry it
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_filters_parse() {
        let raw = r#"{
            "symbol": "ETHBTC",
            "status": "TRADING",
            "baseAsset": "ETH",
            "quoteAsset": "BTC",
            "filters": [
                {"filterType": "PRICE_FILTER", "minPrice": "0.00000100", "maxPrice": "100000.0", "tickSize": "0.00000100"},
                {"filterType": "LOT_SIZE", "minQty": "0.00010000", "maxQty": "100000.0", "stepSize": "0.00010000"},
                {"filterType": "NOTIONAL", "minNotional": "0.00010000"}
            ]
        }"#;

        let info: SymbolInfo = serde_json::from_str(raw).unwrap();
        assert!(info.is_trading());
        let lot = info.lot_size();
        assert_eq!(lot.step_size, dec!(0.0001));
        assert_eq!(lot.min_qty, dec!(0.0001));
        assert_eq!(info.min_notional(), dec!(0.0001));
        assert_eq!(info.tick_size(), dec!(0.000001));
    }

    #[test]
    fn test_missing_filters_use_defaults() {
        let raw = r#"{"symbol": "ETHBTC", "status": "BREAK", "baseAsset": "ETH", "quoteAsset": "BTC"}"#;
        let info: SymbolInfo = serde_json::from_str(raw).unwrap();
        assert!(!info.is_trading());
        assert_eq!(info.lot_size(), LotSizeRules::default());
        assert_eq!(info.min_notional(), dec!(10));
        assert_eq!(info.tick_size(), dec!(0.00000001));
    }

    #[test]
    fn test_book_ticker_frame_parses() {
        let raw = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
        let update: BookTickerUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.symbol, "BNBUSDT");
        assert_eq!(update.bid_price, dec!(25.3519));
        assert_eq!(update.ask_qty, dec!(40.66));
        assert!(update.event_time.is_none());
    }
}
