//! Triangular cycle detection over a price snapshot.
//!
//! A triangle starts and ends in one base currency and crosses two other
//! assets. Each leg trades at the executable side of the book (ask when
//! buying, bid when selling) and pays the taker fee once, so a cycle rate
//! above 1.0 is profit after fees at top-of-book prices.

use crate::config::DetectorConfig;
use crate::exchange::{OrderSide, SymbolInfo};
use crate::market::Quote;
use crate::utils::decimal::{rate_to_profit_pct, safe_div};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// One conversion step of a triangle.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub symbol: String,
    pub side: OrderSide,
    /// Executable price: ask for a buy, bid for a sell
    pub price: Decimal,
    /// Top-of-book quantity on the executable side, in market base units
    pub available_qty: Decimal,
    /// Relative bid-ask spread of the leg's market
    pub spread: Decimal,
    /// Net conversion rate of this leg (fee included)
    pub rate: Decimal,
}

/// A profitable three-leg cycle at a point in time.
#[derive(Debug, Clone)]
pub struct Opportunity {
    /// Currency the cycle starts and ends in
    pub base: String,
    pub legs: Vec<Leg>,
    /// Product of the three leg rates
    pub net_rate: Decimal,
    pub profit_pct: Decimal,
    /// Smallest top-of-book quantity across the legs
    pub min_leg_volume: Decimal,
    /// Widest relative spread across the legs
    pub max_leg_spread: Decimal,
    /// Detection time, milliseconds since epoch
    pub detected_at: i64,
}

impl Opportunity {
    /// Stable identity of the cycle's path, independent of prices.
    pub fn route_signature(&self) -> String {
        let mut sig = self.base.clone();
        for leg in &self.legs {
            let side = match leg.side {
                OrderSide::Buy => "B",
                OrderSide::Sell => "S",
            };
            sig.push('>');
            sig.push_str(&leg.symbol);
            sig.push(':');
            sig.push_str(side);
        }
        sig
    }
}

struct PairInfo {
    base_asset: String,
    quote_asset: String,
}

/// Finds triangles in a snapshot. Symbol topology is fixed at construction
/// from exchange info; only prices change between cycles.
pub struct Detector {
    config: DetectorConfig,
    pairs: HashMap<String, PairInfo>,
    /// asset -> (counter asset, symbol) for every market touching it
    markets: HashMap<String, Vec<(String, String)>>,
}

impl Detector {
    pub fn new(config: DetectorConfig, symbols: &[SymbolInfo]) -> Self {
        let mut pairs = HashMap::new();
        let mut markets: HashMap<String, Vec<(String, String)>> = HashMap::new();

        for info in symbols.iter().filter(|s| s.is_trading()) {
            pairs.insert(
                info.symbol.clone(),
                PairInfo {
                    base_asset: info.base_asset.clone(),
                    quote_asset: info.quote_asset.clone(),
                },
            );
            markets
                .entry(info.base_asset.clone())
                .or_default()
                .push((info.quote_asset.clone(), info.symbol.clone()));
            markets
                .entry(info.quote_asset.clone())
                .or_default()
                .push((info.base_asset.clone(), info.symbol.clone()));
        }

        debug!(
            symbols = pairs.len(),
            assets = markets.len(),
            "Detector topology built"
        );

        Self {
            config,
            pairs,
            markets,
        }
    }

    /// All triangles above the profit threshold, most profitable first.
    /// Pure over the snapshot: the same input always yields the same output.
    pub fn detect(&self, snapshot: &HashMap<String, Quote>) -> Vec<Opportunity> {
        let detected_at = chrono::Utc::now().timestamp_millis();
        let mut out = Vec::new();

        for base in &self.config.base_currencies {
            let Some(neighbors) = self.markets.get(base) else {
                continue;
            };

            for i in 0..neighbors.len() {
                for j in (i + 1)..neighbors.len() {
                    let (x, sym_bx) = &neighbors[i];
                    let (y, sym_by) = &neighbors[j];
                    if x == y || x == base || y == base {
                        continue;
                    }
                    let Some(sym_xy) = self.cross_symbol(x, y) else {
                        continue;
                    };

                    // Both traversal directions of the same triangle
                    for (mid1, mid2, s1, s2, s3) in [
                        (x, y, sym_bx, sym_xy, sym_by),
                        (y, x, sym_by, sym_xy, sym_bx),
                    ] {
                        if let Some(opp) = self.build_route(
                            base,
                            &[(base, mid1, s1), (mid1, mid2, s2), (mid2, base, s3)],
                            snapshot,
                            detected_at,
                        ) {
                            if opp.profit_pct >= self.config.min_profit_pct {
                                out.push(opp);
                            }
                        }
                    }
                }
            }
        }

        out.sort_by(|a, b| b.profit_pct.cmp(&a.profit_pct));
        out
    }

    fn cross_symbol(&self, x: &str, y: &str) -> Option<&String> {
        self.markets
            .get(x)?
            .iter()
            .find(|(other, _)| other == y)
            .map(|(_, symbol)| symbol)
    }

    fn build_route(
        &self,
        base: &str,
        hops: &[(&str, &str, &String); 3],
        snapshot: &HashMap<String, Quote>,
        detected_at: i64,
    ) -> Option<Opportunity> {
        let mut legs = Vec::with_capacity(3);
        let mut net_rate = Decimal::ONE;

        for (from, to, symbol) in hops {
            let quote = snapshot.get(*symbol)?;
            let leg = self.leg(from, to, quote)?;
            net_rate *= leg.rate;
            legs.push(leg);
        }

        let min_leg_volume = legs
            .iter()
            .map(|l| l.available_qty)
            .min()
            .unwrap_or(Decimal::ZERO);
        let max_leg_spread = legs
            .iter()
            .map(|l| l.spread)
            .max()
            .unwrap_or(Decimal::ZERO);

        Some(Opportunity {
            base: base.to_string(),
            legs,
            net_rate,
            profit_pct: rate_to_profit_pct(net_rate),
            min_leg_volume,
            max_leg_spread,
            detected_at,
        })
    }

    /// Conversion of `from` into `to` across one market. Buying the market
    /// base pays the ask; selling it receives the bid. The fee is applied
    /// exactly once.
    fn leg(&self, from: &str, to: &str, quote: &Quote) -> Option<Leg> {
        let info = self.pairs.get(&quote.symbol)?;
        let fee_keep = Decimal::ONE - self.config.fee_rate;

        if from == info.quote_asset && to == info.base_asset {
            Some(Leg {
                symbol: quote.symbol.clone(),
                side: OrderSide::Buy,
                price: quote.ask,
                available_qty: quote.ask_qty,
                spread: quote.spread(),
                rate: safe_div(fee_keep, quote.ask),
            })
        } else if from == info.base_asset && to == info.quote_asset {
            Some(Leg {
                symbol: quote.symbol.clone(),
                side: OrderSide::Sell,
                price: quote.bid,
                available_qty: quote.bid_qty,
                spread: quote.spread(),
                rate: quote.bid * fee_keep,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn symbol(symbol: &str, base: &str, quote: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            status: "TRADING".to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            filters: vec![],
        }
    }

    fn quote(symbol: &str, bid: Decimal, ask: Decimal) -> (String, Quote) {
        let now = Utc::now().timestamp_millis();
        (
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                bid,
                ask,
                bid_qty: dec!(100),
                ask_qty: dec!(100),
                event_time: now,
                received_at: now,
            },
        )
    }

    fn detector(min_profit_pct: Decimal) -> Detector {
        let config = DetectorConfig {
            base_currencies: vec!["USDT".to_string()],
            fee_rate: dec!(0.001),
            min_profit_pct,
            cadence_ms: 100,
        };
        Detector::new(
            config,
            &[
                symbol("BTCUSDT", "BTC", "USDT"),
                symbol("ETHUSDT", "ETH", "USDT"),
                symbol("ETHBTC", "ETH", "BTC"),
            ],
        )
    }

    fn snapshot(ethbtc_bid: Decimal) -> HashMap<String, Quote> {
        [
            quote("BTCUSDT", dec!(30000), dec!(30001)),
            quote("ETHUSDT", dec!(2000), dec!(2001)),
            quote("ETHBTC", ethbtc_bid, dec!(0.0673)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_detects_profitable_triangle() {
        let detector = detector(dec!(0.2));
        // Buy ETH with USDT, sell ETH into BTC, sell BTC for USDT:
        // 0.0672 * 30000 / 2001 * 0.999^3 ~ 1.00448
        let opps = detector.detect(&snapshot(dec!(0.0672)));

        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.base, "USDT");
        assert!(opp.profit_pct > dec!(0.44) && opp.profit_pct < dec!(0.45));

        assert_eq!(opp.legs[0].symbol, "ETHUSDT");
        assert_eq!(opp.legs[0].side, OrderSide::Buy);
        assert_eq!(opp.legs[0].price, dec!(2001));
        assert_eq!(opp.legs[1].symbol, "ETHBTC");
        assert_eq!(opp.legs[1].side, OrderSide::Sell);
        assert_eq!(opp.legs[1].price, dec!(0.0672));
        assert_eq!(opp.legs[2].symbol, "BTCUSDT");
        assert_eq!(opp.legs[2].side, OrderSide::Sell);
        assert_eq!(opp.legs[2].price, dec!(30000));
    }

    #[test]
    fn test_non_trading_pair_excluded_from_topology() {
        let config = DetectorConfig {
            base_currencies: vec!["USDT".to_string()],
            fee_rate: dec!(0.001),
            min_profit_pct: dec!(0.2),
            cadence_ms: 100,
        };
        let mut halted = symbol("ETHBTC", "ETH", "BTC");
        halted.status = "BREAK".to_string();
        let detector = Detector::new(
            config,
            &[
                symbol("BTCUSDT", "BTC", "USDT"),
                symbol("ETHUSDT", "ETH", "USDT"),
                halted,
            ],
        );

        // Same quotes that are profitable with ETHBTC tradable
        assert!(detector.detect(&snapshot(dec!(0.0672))).is_empty());
    }

    #[test]
    fn test_fee_applied_once_per_leg() {
        let detector = detector(dec!(-100)); // keep every candidate
        let opps = detector.detect(&snapshot(dec!(0.0672)));

        let opp = opps
            .iter()
            .find(|o| o.legs[0].symbol == "ETHUSDT")
            .unwrap();
        let fee_keep = dec!(0.999);
        let expected =
            (fee_keep / dec!(2001)) * (dec!(0.0672) * fee_keep) * (dec!(30000) * fee_keep);
        assert_eq!(opp.net_rate, expected);
    }

    #[test]
    fn test_marginal_triangle_below_threshold() {
        let detector = detector(dec!(0.2));
        // 0.0669 * 30000 / 2001 * 0.999^3 ~ 1.00001: positive but marginal
        let opps = detector.detect(&snapshot(dec!(0.0669)));
        assert!(opps.is_empty());
    }

    #[test]
    fn test_detect_is_pure_over_snapshot() {
        let detector = detector(dec!(0.2));
        let snap = snapshot(dec!(0.0672));

        let first = detector.detect(&snap);
        let second = detector.detect(&snap);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].net_rate, second[0].net_rate);
        assert_eq!(first[0].route_signature(), second[0].route_signature());
    }

    #[test]
    fn test_missing_leg_quote_skips_triangle() {
        let detector = detector(dec!(-100));
        let mut snap = snapshot(dec!(0.0672));
        snap.remove("ETHBTC");
        assert!(detector.detect(&snap).is_empty());
    }

    #[test]
    fn test_volume_and_spread_aggregates() {
        let detector = detector(dec!(-100));
        let mut snap = snapshot(dec!(0.0672));
        snap.get_mut("ETHBTC").unwrap().bid_qty = dec!(3);

        let opps = detector.detect(&snap);
        let opp = opps
            .iter()
            .find(|o| o.legs[0].symbol == "ETHUSDT")
            .unwrap();
        assert_eq!(opp.min_leg_volume, dec!(3));
        // ETHBTC has the widest spread: (0.0673 - 0.0672) / 0.0673
        assert_eq!(
            opp.max_leg_spread,
            (dec!(0.0673) - dec!(0.0672)) / dec!(0.0673)
        );
    }

    #[test]
    fn test_route_signature_encodes_path() {
        let detector = detector(dec!(0.2));
        let opps = detector.detect(&snapshot(dec!(0.0672)));
        assert_eq!(
            opps[0].route_signature(),
            "USDT>ETHUSDT:B>ETHBTC:S>BTCUSDT:S"
        );
    }
}
