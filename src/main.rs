//! Triangular Arbitrage Pipeline - Main Entry Point
//!
//! Streams top-of-book quotes from Binance, detects triangular cycles, and
//! executes validated routes either against the exchange or in simulation.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use triarb::config::Config;
use triarb::exchange::{
    ws_base_url, BinanceClient, ExchangeClient, MockExchangeClient, StreamManager, SymbolInfo,
};
use triarb::market::PriceCache;
use triarb::metrics::PipelineMetrics;
use triarb::persistence::HistoryStore;
use triarb::resilience::{CircuitBreaker, RateLimiter};
use triarb::strategy::{Detector, Executor, Opportunity, Validator};

/// Triangular arbitrage CLI
#[derive(Parser)]
#[command(name = "triarb")]
#[command(version, about = "Triangular arbitrage pipeline for Binance spot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recent trade history from the local database
    History {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/history.db")]
        db: String,

        /// Number of trades to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::History { db, limit }) => return show_history(&db, limit),
        None => {}
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║        Triangular Arbitrage Pipeline v{}               ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    if config.exchange.simulation {
        info!("📝 SIMULATION MODE - orders are filled in memory");
    } else {
        warn!("⚠️  LIVE TRADING MODE - real orders will be placed!");
    }

    run_pipeline(config).await
}

async fn run_pipeline(config: Config) -> Result<()> {
    let metrics = Arc::new(PipelineMetrics::new());
    let cache = Arc::new(PriceCache::new(config.cache.staleness_ms));
    let limiter = Arc::new(
        RateLimiter::new()
            .with_limit(
                "rest",
                config.resilience.rest_requests_per_min,
                Duration::from_secs(60),
            )
            .with_limit(
                "orders",
                config.resilience.orders_per_sec,
                Duration::from_secs(1),
            )
            .with_limit(
                "advisory",
                config.resilience.advisory_per_sec,
                Duration::from_secs(1),
            ),
    );

    // Market data always comes from the real exchange; simulation only
    // changes where orders go
    let rest = BinanceClient::new(&config.exchange, &config.resilience, Arc::clone(&limiter))?;
    rest.ping().await?;
    info!("✅ Exchange reachable");

    let all_symbols = rest.get_exchange_info().await?;
    let symbols = triangle_symbols(all_symbols, &config.detector.base_currencies);
    anyhow::ensure!(
        !symbols.is_empty(),
        "no tradable symbols connect the configured base currencies"
    );
    info!(
        symbols = symbols.len(),
        bases = ?config.detector.base_currencies,
        "Symbol universe selected"
    );

    let order_client: Arc<dyn ExchangeClient> = if config.exchange.simulation {
        let mock = MockExchangeClient::new(config.detector.fee_rate).with_symbols(symbols.clone());
        for base in &config.detector.base_currencies {
            // Generous paper balances so sizing, not funding, is the limit
            mock.set_balance(base, config.execution.trade_amount * dec!(1000))
                .await;
        }
        Arc::new(mock)
    } else {
        Arc::new(BinanceClient::new(
            &config.exchange,
            &config.resilience,
            Arc::clone(&limiter),
        )?)
    };

    std::fs::create_dir_all("data")?;
    let store = Arc::new(HistoryStore::new("data/history.db")?);

    let mut detector = Detector::new(config.detector.clone(), &symbols);
    let validator = Validator::new(
        config.scoring.clone(),
        config.detector.min_profit_pct,
        None,
        CircuitBreaker::new(
            "advisory",
            config.resilience.failure_threshold,
            Duration::from_secs(config.resilience.recovery_timeout_secs),
        ),
        Arc::clone(&limiter),
    );
    let executor = Arc::new(Executor::new(
        Arc::clone(&order_client),
        config.execution.clone(),
        config.detector.fee_rate,
        symbols.clone(),
        Some(Arc::clone(&store)),
        Arc::clone(&metrics),
    ));

    // Shutdown fan-out: ctrl-c flips the watch, every task observes it
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let stream = StreamManager::new(
        config.stream.clone(),
        ws_base_url(config.exchange.testnet),
        Arc::clone(&cache),
        Arc::clone(&metrics),
    );
    let stream_symbols: Vec<String> = symbols.iter().map(|s| s.symbol.clone()).collect();
    let stream_shutdown = shutdown_rx.clone();
    let mut stream_task =
        tokio::spawn(async move { stream.run(stream_symbols, stream_shutdown).await });
    let mut stream_finished = false;

    // Execution runs on its own task; the single-slot channel means a busy
    // executor sheds new routes instead of queueing stale ones
    let (trade_tx, mut trade_rx) = mpsc::channel::<Opportunity>(1);
    let exec_handle = Arc::clone(&executor);
    let mut exec_shutdown = shutdown_rx.clone();
    let mut executor_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                opportunity = trade_rx.recv() => {
                    let Some(opportunity) = opportunity else { return };
                    let trade = exec_handle.execute(&opportunity).await;
                    info!(state = %trade.state, route = %trade.route, "Trade finished");
                }
                _ = exec_shutdown.changed() => {
                    if *exec_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    info!("🚀 Starting detection loop");

    let mut ticker = interval(Duration::from_millis(config.detector.cadence_ms));
    let mut refresh = interval(Duration::from_secs(config.exchange.metadata_refresh_secs));
    refresh.tick().await; // the first tick is immediate
    let mut shutdown = shutdown_rx.clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = cache.snapshot();
                if snapshot.is_empty() {
                    continue;
                }

                let started = std::time::Instant::now();
                let opportunities = detector.detect(&snapshot);
                metrics.detection_cycle(
                    started.elapsed().as_micros() as u64,
                    opportunities.len() as u64,
                );

                // One route at a time; balances are shared across triangles
                if let Some(opportunity) = opportunities.first() {
                    let assessment = validator.assess(opportunity).await;
                    if let Err(e) = store.append_opportunity(opportunity, &assessment) {
                        warn!("Failed to persist opportunity: {:#}", e);
                    }

                    if assessment.accepted {
                        metrics.opportunity_validated();
                        info!(
                            route = %opportunity.route_signature(),
                            profit_pct = %opportunity.profit_pct,
                            score = %assessment.score,
                            "💡 Opportunity accepted"
                        );
                        if trade_tx.try_send(opportunity.clone()).is_err() {
                            debug!(
                                route = %opportunity.route_signature(),
                                "Executor busy, route skipped"
                            );
                        }
                    }
                }
            }
            _ = refresh.tick() => {
                match rest.get_exchange_info().await {
                    Ok(all) => {
                        let fresh = triangle_symbols(all, &config.detector.base_currencies);
                        if fresh.is_empty() {
                            warn!("Metadata refresh yielded no symbols, keeping current set");
                        } else {
                            info!(symbols = fresh.len(), "Exchange metadata refreshed");
                            detector = Detector::new(config.detector.clone(), &fresh);
                            executor.update_symbols(fresh);
                        }
                    }
                    Err(e) => warn!("Metadata refresh failed: {:#}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = &mut stream_task, if !stream_finished => {
                stream_finished = true;
                match result {
                    Ok(Ok(())) => info!("Market data stream ended"),
                    Ok(Err(e)) => error!("Market data stream failed: {:#}", e),
                    Err(e) => error!("Stream task panicked: {e}"),
                }
                break;
            }
        }
    }

    // Drain: let an in-flight trade finish, then wind down the stream tasks
    let _ = shutdown_tx.send(true);
    drop(trade_tx);
    let grace = Duration::from_secs(config.execution.grace_period_secs);
    if tokio::time::timeout(grace, &mut executor_task).await.is_err() {
        warn!("Executor did not stop within grace period, aborting");
        executor_task.abort();
    }
    if !stream_finished {
        if tokio::time::timeout(grace, &mut stream_task).await.is_err() {
            warn!("Stream did not stop within grace period, aborting");
            stream_task.abort();
        }
    }

    let snapshot = metrics.snapshot();
    let (completed, failed, stopped) = store.trade_counts().unwrap_or((0, 0, 0));
    info!(
        uptime_secs = snapshot.uptime_secs,
        quotes = snapshot.quotes_received,
        cycles = snapshot.detection_cycles,
        detected = snapshot.opportunities_detected,
        completed,
        failed,
        stopped,
        "👋 Pipeline stopped"
    );
    Ok(())
}

/// Symbols that can take part in a triangle: both assets must belong to the
/// universe spanned by the base currencies and the assets bridging at least
/// two of them.
fn triangle_symbols(symbols: Vec<SymbolInfo>, bases: &[String]) -> Vec<SymbolInfo> {
    let base_set: HashSet<&str> = bases.iter().map(String::as_str).collect();

    let mut bridge_counts: HashMap<&str, HashSet<&str>> = HashMap::new();
    for info in symbols.iter().filter(|s| s.is_trading()) {
        let (base, quote) = (info.base_asset.as_str(), info.quote_asset.as_str());
        if base_set.contains(quote) && !base_set.contains(base) {
            bridge_counts.entry(base).or_default().insert(quote);
        }
        if base_set.contains(base) && !base_set.contains(quote) {
            bridge_counts.entry(quote).or_default().insert(base);
        }
    }

    let mut universe: HashSet<&str> = base_set.clone();
    universe.extend(
        bridge_counts
            .iter()
            .filter(|(_, bases)| bases.len() >= 2)
            .map(|(asset, _)| *asset),
    );

    symbols
        .iter()
        .filter(|s| {
            s.is_trading()
                && universe.contains(s.base_asset.as_str())
                && universe.contains(s.quote_asset.as_str())
        })
        .cloned()
        .collect()
}

fn show_history(db: &str, limit: usize) -> Result<()> {
    let store = HistoryStore::new(db)?;
    let trades = store.recent_trades(limit)?;
    let (completed, failed, stopped) = store.trade_counts()?;

    println!(
        "Trades: {} completed, {} failed, {} stopped",
        completed, failed, stopped
    );
    println!();

    if trades.is_empty() {
        println!("No trades recorded yet.");
        return Ok(());
    }

    println!(
        "{:<6} {:<25} {:<10} {:>12} {:>12} {:>9}  ROUTE",
        "ID", "STARTED", "STATE", "IN", "OUT", "PROFIT%"
    );
    for trade in trades {
        println!(
            "{:<6} {:<25} {:<10} {:>12} {:>12} {:>9}  {}",
            trade.id,
            trade.started_at.format("%Y-%m-%d %H:%M:%S"),
            trade.state,
            trade.initial_amount,
            trade
                .final_amount
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            trade
                .realized_profit_pct
                .map(|v| v.round_dp(4).to_string())
                .unwrap_or_else(|| "-".to_string()),
            trade.route,
        );
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "triarb.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("triarb=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Base Currencies: {:?}", config.detector.base_currencies);
    info!(
        "   Fee Rate: {:.2}% per leg",
        config.detector.fee_rate * dec!(100)
    );
    info!("   Min Profit: {}%", config.detector.min_profit_pct);
    info!("   Detection Cadence: {}ms", config.detector.cadence_ms);
    info!("   Trade Amount: {}", config.execution.trade_amount);
    info!(
        "   Stop Loss: {:.1}%",
        config.execution.stop_loss_pct * dec!(100)
    );
    info!(
        "   Stream: {} symbols/connection, queue {}",
        config.stream.batch_size, config.stream.queue_capacity
    );
    info!(
        "   Metadata Refresh: every {}s",
        config.exchange.metadata_refresh_secs
    );
}
