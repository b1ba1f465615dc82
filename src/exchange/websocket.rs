//! Binance WebSocket connection for top-of-book market data.
//!
//! One socket carries a multiplexed `@bookTicker` stream for a batch of
//! symbols. This module only handles the wire: connecting, framing, and
//! turning frames into `Quote`s. Reconnection and supervision live in
//! `stream`.

use crate::exchange::types::BookTickerUpdate;
use crate::market::Quote;
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const SPOT_WS_URL: &str = "wss://stream.binance.com:9443";
const SPOT_TESTNET_WS_URL: &str = "wss://stream.testnet.binance.vision";

pub fn ws_base_url(testnet: bool) -> &'static str {
    if testnet {
        SPOT_TESTNET_WS_URL
    } else {
        SPOT_WS_URL
    }
}

/// Events surfaced to the supervisor. Anything that arrives counts as
/// connection activity for the staleness watchdog.
#[derive(Debug)]
pub enum SocketEvent {
    Quote(Quote),
    /// Pong or server ping; traffic with no market data in it
    Heartbeat,
    /// Server closed the connection
    Closed,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A connected multiplexed book-ticker socket for one symbol batch.
pub struct BookTickerSocket {
    write: WsSink,
    read: WsSource,
}

impl BookTickerSocket {
    pub async fn connect(base_url: &str, symbols: &[String]) -> Result<Self> {
        let url = stream_url(base_url, symbols);
        info!(symbols = symbols.len(), "Connecting to WebSocket: {}", url);

        let (ws_stream, _) = connect_async(&url)
            .await
            .context("Failed to connect to WebSocket")?;
        let (write, read) = ws_stream.split();

        Ok(Self { write, read })
    }

    /// Client-side keepalive ping.
    pub async fn ping(&mut self) -> Result<()> {
        self.write
            .send(Message::Ping(Vec::new().into()))
            .await
            .context("Failed to send ping")
    }

    /// Next event from the socket. `None` means the stream ended.
    pub async fn next_event(&mut self) -> Option<Result<SocketEvent>> {
        loop {
            let msg = self.read.next().await?;
            match msg {
                Ok(Message::Text(text)) => match parse_frame(&text) {
                    Some(quote) => return Some(Ok(SocketEvent::Quote(quote))),
                    // Subscription acks and malformed frames are skipped
                    None => {
                        debug!("Ignoring non-ticker frame: {}", text);
                        continue;
                    }
                },
                Ok(Message::Pong(_)) => return Some(Ok(SocketEvent::Heartbeat)),
                Ok(Message::Ping(_)) => {
                    // Tungstenite queues the pong reply automatically
                    debug!("Received ping");
                    return Some(Ok(SocketEvent::Heartbeat));
                }
                Ok(Message::Close(frame)) => {
                    warn!("WebSocket closed by server: {:?}", frame);
                    return Some(Ok(SocketEvent::Closed));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e).context("WebSocket read error")),
            }
        }
    }
}

/// Combined-stream URL for a batch: `/stream?streams=btcusdt@bookTicker/...`
pub fn stream_url(base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", base_url, streams.join("/"))
}

fn parse_frame(text: &str) -> Option<Quote> {
    #[derive(Deserialize)]
    struct StreamWrapper {
        data: BookTickerUpdate,
    }

    let wrapper: StreamWrapper = serde_json::from_str(text).ok()?;
    Some(quote_from_update(wrapper.data))
}

fn quote_from_update(update: BookTickerUpdate) -> Quote {
    let received_at = Utc::now().timestamp_millis();
    Quote {
        symbol: update.symbol,
        bid: update.bid_price,
        ask: update.ask_price,
        bid_qty: update.bid_qty,
        ask_qty: update.ask_qty,
        // Spot book-ticker frames carry no event time; treat receipt as it
        event_time: update.event_time.unwrap_or(received_at),
        received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stream_url_is_multiplexed() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHBTC".to_string()];
        let url = stream_url("wss://stream.binance.com:9443", &symbols);
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/ethbtc@bookTicker"
        );
    }

    #[test]
    fn test_parse_combined_stream_frame() {
        let raw = r#"{"stream":"bnbusdt@bookTicker","data":{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}}"#;
        let quote = parse_frame(raw).unwrap();
        assert_eq!(quote.symbol, "BNBUSDT");
        assert_eq!(quote.bid, dec!(25.3519));
        assert_eq!(quote.ask, dec!(25.3652));
        // No event time on the frame, so latency reads as zero
        assert_eq!(quote.event_time, quote.received_at);
    }

    #[test]
    fn test_non_ticker_frames_ignored() {
        assert!(parse_frame(r#"{"result":null,"id":1}"#).is_none());
        assert!(parse_frame("not json").is_none());
    }
}
