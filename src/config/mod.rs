//! Configuration management for the arbitrage pipeline.
//!
//! One immutable `Config` is built at startup from a config file and
//! environment variables and passed explicitly to each component's
//! constructor. No component reads global mutable state at call time.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange credentials and mode
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// WebSocket stream tuning
    #[serde(default)]
    pub stream: StreamConfig,
    /// Price cache tuning
    #[serde(default)]
    pub cache: CacheConfig,
    /// Triangle detection parameters
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Opportunity validation and scoring
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Trade execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Circuit breaker / rate limiter knobs
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Simulate order placement instead of sending to the exchange
    #[serde(default = "default_simulation")]
    pub simulation: bool,
    /// Exchange metadata (symbol statuses, filters) refresh interval
    #[serde(default = "default_metadata_refresh_secs")]
    pub metadata_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Symbols per multiplexed stream connection
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bounded per-batch message queue; overflow sheds the oldest message
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consecutive failed connects before a batch is declared fatal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base reconnect delay in milliseconds (doubled per attempt)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Ping interval; must be shorter than the server idle-disconnect timeout
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// No traffic (data or pong) for this long forces a batch reconnect
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Quotes received later than this after their event time are rejected
    #[serde(default = "default_max_quote_latency_ms")]
    pub max_quote_latency_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are excluded from snapshots
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Base currencies that triangles start and end in
    #[serde(default = "default_base_currencies")]
    pub base_currencies: Vec<String>,
    /// Taker fee rate, applied once per leg
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Candidates below this profit percentage are discarded
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: Decimal,
    /// Detection cadence in milliseconds (off the hot ingestion path)
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Minimum volume per leg, in base-currency units
    #[serde(default = "default_min_leg_volume")]
    pub min_leg_volume: Decimal,
    /// Maximum relative bid-ask spread on any leg
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    /// Weight of normalized profit in the confidence score
    #[serde(default = "default_profit_weight")]
    pub profit_weight: Decimal,
    /// Weight of normalized volume in the confidence score
    #[serde(default = "default_volume_weight")]
    pub volume_weight: Decimal,
    /// Weight of (inverted) normalized spread in the confidence score
    #[serde(default = "default_spread_weight")]
    pub spread_weight: Decimal,
    /// Minimum advisory confidence (0-100) to accept an external opinion
    #[serde(default = "default_advisory_min_confidence")]
    pub advisory_min_confidence: Decimal,
    /// Budget for the advisory call; it sits on the detection hot path
    #[serde(default = "default_advisory_timeout_ms")]
    pub advisory_timeout_ms: u64,
    /// Per-route validation result TTL in milliseconds
    #[serde(default = "default_result_ttl_ms")]
    pub result_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Amount of base currency committed to the first leg
    #[serde(default = "default_trade_amount")]
    pub trade_amount: Decimal,
    /// Slippage buffer applied to each leg's limit price
    #[serde(default = "default_slippage_buffer")]
    pub slippage_buffer: Decimal,
    /// Running amount below `initial * (1 - stop_loss_pct)` stops the trade
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// REST order timeout in seconds
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    /// Grace period on shutdown for in-flight trades to reach a terminal state
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures before a circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before probing (half-open)
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// REST request budget per minute
    #[serde(default = "default_rest_requests_per_min")]
    pub rest_requests_per_min: u32,
    /// Order placements per second
    #[serde(default = "default_orders_per_sec")]
    pub orders_per_sec: u32,
    /// Advisory scorer calls per second
    #[serde(default = "default_advisory_per_sec")]
    pub advisory_per_sec: u32,
}

// Default value functions

fn default_simulation() -> bool {
    true
}

fn default_metadata_refresh_secs() -> u64 {
    3_600
}

fn default_batch_size() -> usize {
    50
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stale_threshold_secs() -> u64 {
    60
}

fn default_max_quote_latency_ms() -> i64 {
    5_000
}

fn default_staleness_ms() -> i64 {
    5_000
}

fn default_base_currencies() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "BNB".to_string(),
        "USDT".to_string(),
    ]
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1% taker)
}

fn default_min_profit_pct() -> Decimal {
    Decimal::new(2, 1) // 0.2%
}

fn default_cadence_ms() -> u64 {
    100
}

fn default_min_leg_volume() -> Decimal {
    Decimal::new(1, 2) // 0.01 base units
}

fn default_max_spread() -> Decimal {
    Decimal::new(2, 2) // 0.02 (2%)
}

fn default_profit_weight() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_volume_weight() -> Decimal {
    Decimal::new(3, 1) // 0.3
}

fn default_spread_weight() -> Decimal {
    Decimal::new(2, 1) // 0.2
}

fn default_advisory_min_confidence() -> Decimal {
    Decimal::new(70, 0)
}

fn default_advisory_timeout_ms() -> u64 {
    500
}

fn default_result_ttl_ms() -> u64 {
    500
}

fn default_trade_amount() -> Decimal {
    Decimal::new(1, 2) // 0.01 base units
}

fn default_slippage_buffer() -> Decimal {
    Decimal::new(5, 4) // 0.0005 (0.05%)
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(1, 2) // 0.01 (1%)
}

fn default_order_timeout_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_rest_requests_per_min() -> u32 {
    1_200
}

fn default_orders_per_sec() -> u32 {
    10
}

fn default_advisory_per_sec() -> u32 {
    5
}

impl Config {
    /// Load configuration from a config file and environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("TRIARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.detector.fee_rate >= Decimal::ZERO && self.detector.fee_rate < Decimal::new(1, 1),
            "fee_rate must be in [0, 0.1)"
        );

        anyhow::ensure!(
            self.detector.min_profit_pct >= Decimal::ZERO,
            "min_profit_pct must be non-negative"
        );

        anyhow::ensure!(
            !self.detector.base_currencies.is_empty(),
            "at least one base currency is required"
        );

        let weight_sum = self.scoring.profit_weight
            + self.scoring.volume_weight
            + self.scoring.spread_weight;
        anyhow::ensure!(
            weight_sum == Decimal::ONE,
            "score weights must sum to 1, got {weight_sum}"
        );

        anyhow::ensure!(
            self.scoring.max_spread > Decimal::ZERO,
            "max_spread must be positive"
        );

        anyhow::ensure!(
            self.execution.trade_amount > Decimal::ZERO,
            "trade_amount must be positive"
        );

        anyhow::ensure!(
            self.execution.stop_loss_pct > Decimal::ZERO
                && self.execution.stop_loss_pct < Decimal::ONE,
            "stop_loss_pct must be between 0 and 1"
        );

        anyhow::ensure!(self.stream.batch_size > 0, "batch_size must be positive");

        anyhow::ensure!(
            self.exchange.metadata_refresh_secs > 0,
            "metadata_refresh_secs must be positive"
        );

        anyhow::ensure!(
            self.stream.base_delay_ms > 0 && self.stream.base_delay_ms <= self.stream.max_delay_ms,
            "base_delay_ms must be positive and <= max_delay_ms"
        );

        if !self.exchange.simulation {
            anyhow::ensure!(
                !self.exchange.api_key.is_empty() && !self.exchange.secret_key.is_empty(),
                "live trading requires API credentials"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            stream: StreamConfig::default(),
            cache: CacheConfig::default(),
            detector: DetectorConfig::default(),
            scoring: ScoringConfig::default(),
            execution: ExecutionConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            simulation: default_simulation(),
            metadata_refresh_secs: default_metadata_refresh_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            max_quote_latency_ms: default_max_quote_latency_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_ms: default_staleness_ms(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_currencies: default_base_currencies(),
            fee_rate: default_fee_rate(),
            min_profit_pct: default_min_profit_pct(),
            cadence_ms: default_cadence_ms(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_leg_volume: default_min_leg_volume(),
            max_spread: default_max_spread(),
            profit_weight: default_profit_weight(),
            volume_weight: default_volume_weight(),
            spread_weight: default_spread_weight(),
            advisory_min_confidence: default_advisory_min_confidence(),
            advisory_timeout_ms: default_advisory_timeout_ms(),
            result_ttl_ms: default_result_ttl_ms(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            trade_amount: default_trade_amount(),
            slippage_buffer: default_slippage_buffer(),
            stop_loss_pct: default_stop_loss_pct(),
            order_timeout_secs: default_order_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            rest_requests_per_min: default_rest_requests_per_min(),
            orders_per_sec: default_orders_per_sec(),
            advisory_per_sec: default_advisory_per_sec(),
        }
    }
}
