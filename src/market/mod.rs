//! Top-of-book quote model and the concurrent price cache.
//!
//! Quotes are immutable and replaced wholesale on each update; the cache is
//! the only shared state between the ingestion path and the detector. The
//! lock is held only for the duration of a map write or snapshot copy, never
//! across an await.

use crate::error::PipelineError;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

/// Best bid/ask for a trading pair at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
    /// Exchange event time, milliseconds since epoch
    pub event_time: i64,
    /// Local receive time, milliseconds since epoch
    pub received_at: i64,
}

impl Quote {
    /// Time between the exchange event and local receipt.
    pub fn receive_latency_ms(&self) -> i64 {
        self.received_at - self.event_time
    }

    /// Reject malformed or too-late quotes before they enter the cache.
    pub fn validate(&self, max_latency_ms: i64) -> Result<(), PipelineError> {
        if self.bid <= Decimal::ZERO {
            return Err(PipelineError::Validation(format!(
                "{}: non-positive bid {}",
                self.symbol, self.bid
            )));
        }
        if self.ask < self.bid {
            return Err(PipelineError::Validation(format!(
                "{}: ask {} below bid {}",
                self.symbol, self.ask, self.bid
            )));
        }
        if self.receive_latency_ms() > max_latency_ms {
            return Err(PipelineError::Validation(format!(
                "{}: receive latency {}ms above ceiling {}ms",
                self.symbol,
                self.receive_latency_ms(),
                max_latency_ms
            )));
        }
        Ok(())
    }

    /// Relative bid-ask spread.
    pub fn spread(&self) -> Decimal {
        crate::utils::decimal::relative_spread(self.bid, self.ask)
    }
}

/// Concurrency-safe map of symbol to latest quote with staleness eviction.
pub struct PriceCache {
    quotes: Mutex<HashMap<String, Quote>>,
    staleness_ms: i64,
}

impl PriceCache {
    pub fn new(staleness_ms: i64) -> Self {
        Self {
            quotes: Mutex::new(HashMap::new()),
            staleness_ms,
        }
    }

    /// Replace the stored quote for a symbol. No partial mutation.
    pub fn update(&self, quote: Quote) {
        let mut quotes = self.quotes.lock().expect("price cache lock poisoned");
        quotes.insert(quote.symbol.clone(), quote);
    }

    /// Latest quote for a symbol, if present (staleness not applied here).
    pub fn get(&self, symbol: &str) -> Option<Quote> {
        let quotes = self.quotes.lock().expect("price cache lock poisoned");
        quotes.get(symbol).cloned()
    }

    /// Point-in-time copy of all fresh quotes. The detector never sees
    /// stale legs; downstream computation runs without holding the lock.
    pub fn snapshot(&self) -> HashMap<String, Quote> {
        self.snapshot_at(Utc::now().timestamp_millis())
    }

    fn snapshot_at(&self, now_ms: i64) -> HashMap<String, Quote> {
        let quotes = self.quotes.lock().expect("price cache lock poisoned");
        quotes
            .iter()
            .filter(|(_, q)| now_ms - q.received_at <= self.staleness_ms)
            .map(|(s, q)| (s.clone(), q.clone()))
            .collect()
    }

    /// Number of entries, stale included.
    pub fn len(&self) -> usize {
        self.quotes.lock().expect("price cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries older than the staleness window. Returns removed count.
    pub fn purge_stale(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let mut quotes = self.quotes.lock().expect("price cache lock poisoned");
        let before = quotes.len();
        quotes.retain(|_, q| now_ms - q.received_at <= self.staleness_ms);
        before - quotes.len()
    }
}
