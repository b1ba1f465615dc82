//! Supervised market-data ingestion.
//!
//! Symbols are split into batches, one socket per batch, each with its own
//! reconnect loop so a flapping connection only degrades its slice of the
//! symbol universe. Each batch owns a bounded queue and a consumer that
//! validates quotes and writes the cache; when a queue is full the oldest
//! quote of that batch is shed, never the newest, and never another
//! batch's.

use crate::config::StreamConfig;
use crate::error::PipelineError;
use crate::exchange::websocket::{BookTickerSocket, SocketEvent};
use crate::market::{PriceCache, Quote};
use crate::metrics::PipelineMetrics;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Bounded quote queue with drop-oldest overflow.
///
/// tokio's mpsc can only reject the incoming message when full; shedding
/// the oldest needs a deque under a short-lived lock.
pub struct QuoteQueue {
    inner: Mutex<VecDeque<Quote>>,
    notify: Notify,
    capacity: usize,
}

impl QuoteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a quote, returning the quote that was shed if the queue
    /// was full.
    pub fn push(&self, quote: Quote) -> Option<Quote> {
        let shed = {
            let mut inner = self.inner.lock().expect("quote queue lock poisoned");
            let shed = if inner.len() >= self.capacity {
                inner.pop_front()
            } else {
                None
            };
            inner.push_back(quote);
            shed
        };
        self.notify.notify_one();
        shed
    }

    /// Wait for the next quote.
    pub async fn pop(&self) -> Quote {
        loop {
            let notified = self.notify.notified();
            if let Some(quote) = self
                .inner
                .lock()
                .expect("quote queue lock poisoned")
                .pop_front()
            {
                return quote;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("quote queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split symbols into connection-sized batches, order preserved.
pub fn batches(symbols: &[String], batch_size: usize) -> Vec<Vec<String>> {
    symbols
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Exponential backoff with a cap and +/-25% jitter so batches that died
/// together do not reconnect in lockstep.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);
    let jitter = 0.75 + fastrand::f64() * 0.5;
    Duration::from_millis(((exp as f64) * jitter) as u64)
}

/// What a batch session reads from. Lets the supervision loop run against
/// a scripted source in tests.
#[async_trait]
trait QuoteSource: Send {
    async fn next_event(&mut self) -> Option<Result<SocketEvent>>;
    async fn ping(&mut self) -> Result<()>;
}

#[async_trait]
impl QuoteSource for BookTickerSocket {
    async fn next_event(&mut self) -> Option<Result<SocketEvent>> {
        BookTickerSocket::next_event(self).await
    }

    async fn ping(&mut self) -> Result<()> {
        BookTickerSocket::ping(self).await
    }
}

/// Owns the ingestion side of the pipeline: batch sockets in, validated
/// quotes into the cache.
pub struct StreamManager {
    config: StreamConfig,
    ws_base: String,
    cache: Arc<PriceCache>,
    metrics: Arc<PipelineMetrics>,
}

impl StreamManager {
    pub fn new(
        config: StreamConfig,
        ws_base: impl Into<String>,
        cache: Arc<PriceCache>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            config,
            ws_base: ws_base.into(),
            cache,
            metrics,
        }
    }

    /// Run ingestion for `symbols` until shutdown or a batch exhausts its
    /// reconnect budget. A fatal batch brings the whole manager down; the
    /// caller decides whether that ends the process.
    pub async fn run(&self, symbols: Vec<String>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for (batch_id, batch) in batches(&symbols, self.config.batch_size).into_iter().enumerate() {
            // One queue and one consumer per batch: a flooding connection
            // can only shed its own quotes
            let queue = Arc::new(QuoteQueue::new(self.config.queue_capacity));

            let ws_base = self.ws_base.clone();
            let connect_symbols = batch.clone();
            let connector = move || {
                let ws_base = ws_base.clone();
                let symbols = connect_symbols.clone();
                async move { BookTickerSocket::connect(&ws_base, &symbols).await }
            };

            tasks.spawn(run_batch(
                batch_id,
                batch.len(),
                self.config.clone(),
                connector,
                Arc::clone(&queue),
                Arc::clone(&self.metrics),
                shutdown.clone(),
            ));
            tasks.spawn(consume(
                queue,
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
                self.config.max_quote_latency_ms,
                shutdown.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // One batch out of retries: stop the rest and surface it
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
            }
        }

        info!("Stream manager stopped");
        Ok(())
    }
}

/// One batch's connect-read-reconnect loop.
async fn run_batch<S, C, F>(
    batch_id: usize,
    symbol_count: usize,
    config: StreamConfig,
    connector: C,
    queue: Arc<QuoteQueue>,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: QuoteSource + 'static,
    C: Fn() -> F + Send + 'static,
    F: Future<Output = Result<S>> + Send,
{
    let mut attempt: u32 = 0;
    let mut sessions: u64 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match connector().await {
            Ok(socket) => {
                if sessions > 0 {
                    // A dropped session followed by a successful
                    // re-establishment; failed connect attempts don't count
                    metrics.reconnect();
                }
                sessions += 1;
                attempt = 0;
                info!(batch_id, symbols = symbol_count, "Batch connected");

                read_session(socket, &config, &queue, &metrics, &mut shutdown).await;
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(batch_id, attempt, "Batch connect failed: {:#}", e);
                attempt += 1;
                if attempt > config.max_retries {
                    error!(batch_id, "Batch exhausted reconnect budget");
                    return Err(PipelineError::Connectivity(format!(
                        "batch {batch_id} failed to connect after {} attempts",
                        config.max_retries
                    ))
                    .into());
                }
            }
        }

        let delay = backoff_delay(attempt, config.base_delay_ms, config.max_delay_ms);
        debug!(batch_id, attempt, ?delay, "Reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Drive one connected socket until it dies, goes quiet, or shutdown.
async fn read_session<S: QuoteSource>(
    mut socket: S,
    config: &StreamConfig,
    queue: &QuoteQueue,
    metrics: &PipelineMetrics,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut heartbeat = interval(Duration::from_secs(config.heartbeat_secs));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately

    let stale_after = Duration::from_secs(config.stale_threshold_secs);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            event = socket.next_event() => {
                match event {
                    Some(Ok(SocketEvent::Quote(quote))) => {
                        last_activity = Instant::now();
                        if queue.push(quote).is_some() {
                            metrics.overflow_dropped();
                        }
                    }
                    Some(Ok(SocketEvent::Heartbeat)) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(SocketEvent::Closed)) | None => {
                        warn!("Socket closed, reconnecting");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("Socket error, reconnecting: {:#}", e);
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > stale_after {
                    warn!(
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Connection gone quiet, forcing reconnect"
                    );
                    return;
                }
                if let Err(e) = socket.ping().await {
                    warn!("Ping failed, reconnecting: {:#}", e);
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// One batch's consumer: validate quotes off the queue and write the cache.
async fn consume(
    queue: Arc<QuoteQueue>,
    cache: Arc<PriceCache>,
    metrics: Arc<PipelineMetrics>,
    max_latency_ms: i64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            quote = queue.pop() => {
                match quote.validate(max_latency_ms) {
                    Ok(()) => {
                        cache.update(quote);
                        metrics.quote_received();
                        metrics.set_cache_size(cache.len());
                    }
                    Err(e) => {
                        if !e.is_recoverable() {
                            return Err(e.into());
                        }
                        metrics.quote_rejected();
                        debug!("Quote rejected: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quote(symbol: &str) -> Quote {
        let now = Utc::now().timestamp_millis();
        Quote {
            symbol: symbol.to_string(),
            bid: dec!(1),
            ask: dec!(1.001),
            bid_qty: dec!(10),
            ask_qty: dec!(10),
            event_time: now,
            received_at: now,
        }
    }

    /// Replays a fixed event list, then stays connected but silent.
    struct ScriptedSource {
        events: VecDeque<SocketEvent>,
    }

    impl ScriptedSource {
        fn new(events: Vec<SocketEvent>) -> Self {
            Self {
                events: events.into_iter().collect(),
            }
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedSource {
        async fn next_event(&mut self) -> Option<Result<SocketEvent>> {
            match self.events.pop_front() {
                Some(event) => Some(Ok(event)),
                None => std::future::pending().await,
            }
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_batches_split_and_preserve_order() {
        let symbols: Vec<String> = (0..7).map(|i| format!("S{i}")).collect();
        let split = batches(&symbols, 3);
        assert_eq!(split.len(), 3);
        assert_eq!(split[0], vec!["S0", "S1", "S2"]);
        assert_eq!(split[2], vec!["S6"]);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for _ in 0..50 {
            let d0 = backoff_delay(0, 500, 60_000);
            assert!(d0 >= Duration::from_millis(375) && d0 <= Duration::from_millis(625));

            let d3 = backoff_delay(3, 500, 60_000);
            assert!(d3 >= Duration::from_millis(3_000) && d3 <= Duration::from_millis(5_000));

            // Far past the cap: only jitter remains
            let capped = backoff_delay(30, 500, 60_000);
            assert!(capped >= Duration::from_millis(45_000));
            assert!(capped <= Duration::from_millis(75_000));
        }
    }

    #[test]
    fn test_queue_sheds_oldest_on_overflow() {
        let queue = QuoteQueue::new(2);
        assert!(queue.push(quote("A")).is_none());
        assert!(queue.push(quote("B")).is_none());

        let shed = queue.push(quote("C")).unwrap();
        assert_eq!(shed.symbol, "A");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overflow_is_isolated_per_batch() {
        // Two batches, two queues, as the manager wires them up
        let first = QuoteQueue::new(1);
        let second = QuoteQueue::new(1);
        second.push(quote("OTHER"));

        first.push(quote("A"));
        assert!(first.push(quote("B")).is_some());

        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_pop_in_fifo_order() {
        let queue = QuoteQueue::new(10);
        queue.push(quote("A"));
        queue.push(quote("B"));

        assert_eq!(queue.pop().await.symbol, "A");
        assert_eq!(queue.pop().await.symbol, "B");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_pop_waits_for_push() {
        let queue = Arc::new(QuoteQueue::new(10));
        let producer = Arc::clone(&queue);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(quote("LATE"));
        });

        let got = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("pop should complete once a quote arrives");
        assert_eq!(got.symbol, "LATE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_session_forces_reconnect_leaving_cache_intact() {
        let config = StreamConfig {
            heartbeat_secs: 1,
            stale_threshold_secs: 2,
            ..StreamConfig::default()
        };
        let queue = QuoteQueue::new(10);
        let cache = PriceCache::new(600_000);
        // Written by another batch's consumer
        cache.update(quote("OTHER"));
        let metrics = PipelineMetrics::new();
        let (_tx, mut rx) = watch::channel(false);

        let socket = ScriptedSource::new(vec![SocketEvent::Quote(quote("MINE"))]);
        tokio::time::timeout(
            Duration::from_secs(30),
            read_session(socket, &config, &queue, &metrics, &mut rx),
        )
        .await
        .expect("staleness watchdog should end the session");

        // Only this batch's session ended; its quote is queued and the
        // other batch's cache entry is untouched
        assert_eq!(queue.len(), 1);
        assert!(cache.get("OTHER").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_counted_only_on_reestablishment() {
        let config = StreamConfig {
            base_delay_ms: 10,
            max_delay_ms: 20,
            stale_threshold_secs: 1_000,
            ..StreamConfig::default()
        };
        let queue = Arc::new(QuoteQueue::new(10));
        let metrics = Arc::new(PipelineMetrics::new());
        let (tx, rx) = watch::channel(false);

        let attempts = Arc::new(AtomicU32::new(0));
        let connector = {
            let attempts = Arc::clone(&attempts);
            move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        // A refused connect, then a session that closes
                        // immediately, then one that stays up
                        0 => anyhow::bail!("connection refused"),
                        1 => Ok(ScriptedSource::new(vec![SocketEvent::Closed])),
                        _ => Ok(ScriptedSource::new(vec![])),
                    }
                }
            }
        };

        let batch = tokio::spawn(run_batch(
            0,
            1,
            config,
            connector,
            Arc::clone(&queue),
            Arc::clone(&metrics),
            rx,
        ));

        while attempts.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tx.send(true).unwrap();
        batch.await.unwrap().unwrap();

        // The failed connect and the first session are not reconnects;
        // only the re-established connection counts
        assert_eq!(metrics.snapshot().reconnects, 1);
    }

    #[tokio::test]
    async fn test_consumer_validates_before_cache() {
        let queue = Arc::new(QuoteQueue::new(10));
        let cache = Arc::new(PriceCache::new(5_000));
        let metrics = Arc::new(PipelineMetrics::new());
        let (tx, rx) = watch::channel(false);

        queue.push(quote("GOOD"));
        let mut crossed = quote("BAD");
        crossed.bid = dec!(2);
        crossed.ask = dec!(1);
        queue.push(crossed);

        let consumer = tokio::spawn(consume(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            5_000,
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();

        assert!(cache.get("GOOD").is_some());
        assert!(cache.get("BAD").is_none());
        let snap = metrics.snapshot();
        assert_eq!(snap.quotes_received, 1);
        assert_eq!(snap.quotes_rejected, 1);
    }
}
