//! Binance spot REST API client.
//!
//! Every outbound call passes the shared rate limiter and this client's
//! circuit breaker; composition happens here, at the call site, so failure
//! propagation is visible.

use crate::config::{ExchangeConfig, ResilienceConfig};
use crate::exchange::traits::ExchangeClient;
use crate::exchange::types::*;
use crate::resilience::{CircuitBreaker, RateLimiter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Rate limiter key shared by all REST traffic from this process.
const LIMITER_KEY: &str = "binance";

pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
}

impl BinanceClient {
    pub fn new(
        config: &ExchangeConfig,
        resilience: &ResilienceConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if config.testnet {
            SPOT_TESTNET_URL.to_string()
        } else {
            SPOT_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
            limiter,
            breaker: CircuitBreaker::new(
                "binance-rest",
                resilience.failure_threshold,
                Duration::from_secs(resilience.recovery_timeout_secs),
            ),
        })
    }

    /// HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        self.limiter.acquire(LIMITER_KEY, "rest", 1).await;
        let url = format!("{}/api/v3/ping", self.base_url);
        self.breaker
            .call(async {
                self.http
                    .get(&url)
                    .send()
                    .await
                    .context("Ping failed")?
                    .error_for_status()
                    .context("Ping returned error status")?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_exchange_info(&self) -> Result<Vec<SymbolInfo>> {
        self.limiter.acquire(LIMITER_KEY, "rest", 20).await;
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let info: ExchangeInfo = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .context("Failed to fetch exchange info")?;
                response
                    .json()
                    .await
                    .context("Failed to parse exchange info response")
            })
            .await?;

        Ok(info.symbols)
    }

    #[instrument(skip(self))]
    async fn get_balances(&self) -> Result<Vec<AccountBalance>> {
        self.limiter.acquire(LIMITER_KEY, "rest", 10).await;

        let query = format!("timestamp={}", Self::timestamp());
        let signature = self.sign(&query);
        let url = format!(
            "{}/api/v3/account?{}&signature={}",
            self.base_url, query, signature
        );

        #[derive(serde::Deserialize)]
        struct Account {
            balances: Vec<AccountBalance>,
        }

        let account: Account = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .get(&url)
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await
                    .context("Failed to fetch account")?;
                response
                    .json()
                    .await
                    .context("Failed to parse account response")
            })
            .await?;

        Ok(account.balances)
    }

    #[instrument(skip(self))]
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse> {
        self.limiter.acquire(LIMITER_KEY, "orders", 1).await;
        if let Some(remaining) = self.limiter.remaining(LIMITER_KEY, "orders") {
            debug!(remaining, "Order budget after acquire");
        }

        let mut params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            (
                "side".to_string(),
                format!("{:?}", order.side).to_uppercase(),
            ),
            (
                "type".to_string(),
                format!("{:?}", order.order_type).to_uppercase(),
            ),
            ("quantity".to_string(), order.quantity.to_string()),
            ("timestamp".to_string(), Self::timestamp().to_string()),
        ];

        if let Some(price) = &order.price {
            params.push(("price".to_string(), price.to_string()));
        }

        if let Some(tif) = &order.time_in_force {
            params.push(("timeInForce".to_string(), format!("{:?}", tif).to_uppercase()));
        }

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query_string, signature
        );

        debug!("Placing order: {:?}", order);

        self.breaker
            .call(async {
                let response = self
                    .http
                    .post(&url)
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await
                    .context("Failed to place order")?;
                response
                    .json()
                    .await
                    .context("Failed to parse order response")
            })
            .await
    }
}
