//! Opportunity validation and confidence scoring.
//!
//! Local checks are authoritative and always run: minimum profit, per-leg
//! volume, per-leg spread, and a weighted confidence score. An optional
//! external advisory scorer folds its confidence/risk opinion into the
//! score and can veto, but it sits behind a circuit breaker, a rate limit,
//! and a hard timeout; when it is slow, broken, or over budget the
//! pipeline degrades to local-only rather than stalling.

use crate::config::ScoringConfig;
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::strategy::detector::Opportunity;
use crate::utils::decimal::{clamp_unit, safe_div};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// External opinion on an opportunity.
#[derive(Debug, Clone)]
pub struct Advice {
    /// Confidence that the opportunity is real, 0-100
    pub confidence: Decimal,
    /// Risk grade, 1 (benign) to 10 (avoid)
    pub risk: u8,
    pub volume_sufficient: bool,
}

/// Seam for an out-of-process analyzer. Implementations must be safe to
/// call concurrently.
#[async_trait]
pub trait AdvisoryScorer: Send + Sync {
    async fn analyze(&self, opportunity: &Opportunity) -> Result<Advice>;
}

/// Validation verdict for one opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub accepted: bool,
    /// Confidence score, 0-100; local, blended with the advisory opinion
    /// when one arrived in time
    pub score: Decimal,
    /// Advisory confidence when an external opinion was obtained in time
    pub advisory_confidence: Option<Decimal>,
    /// Why the opportunity was rejected, if it was
    pub reason: Option<String>,
}

const ADVISORY_KEY: &str = "advisor";
const ADVISORY_SCOPE: &str = "advisory";

/// Stateless checks plus a short-TTL memo of verdicts per route, so the
/// same triangle seen on consecutive detection cycles is not re-scored.
pub struct Validator {
    config: ScoringConfig,
    min_profit_pct: Decimal,
    advisor: Option<Arc<dyn AdvisoryScorer>>,
    breaker: CircuitBreaker,
    limiter: Arc<RateLimiter>,
    memo: Mutex<HashMap<String, (Instant, Assessment)>>,
}

impl Validator {
    pub fn new(
        config: ScoringConfig,
        min_profit_pct: Decimal,
        advisor: Option<Arc<dyn AdvisoryScorer>>,
        breaker: CircuitBreaker,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            min_profit_pct,
            advisor,
            breaker,
            limiter,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and score one opportunity. Memoized per route for the
    /// configured TTL.
    pub async fn assess(&self, opportunity: &Opportunity) -> Assessment {
        let signature = opportunity.route_signature();
        let ttl = Duration::from_millis(self.config.result_ttl_ms);

        if let Some(hit) = self.memo_lookup(&signature, ttl) {
            debug!(route = %signature, "Validation memo hit");
            return hit;
        }

        let assessment = self.assess_uncached(opportunity).await;
        self.memo
            .lock()
            .expect("validator memo lock poisoned")
            .insert(signature, (Instant::now(), assessment.clone()));
        assessment
    }

    fn memo_lookup(&self, signature: &str, ttl: Duration) -> Option<Assessment> {
        let mut memo = self.memo.lock().expect("validator memo lock poisoned");
        match memo.get(signature) {
            Some((at, hit)) if at.elapsed() <= ttl => Some(hit.clone()),
            Some(_) => {
                memo.remove(signature);
                None
            }
            None => None,
        }
    }

    async fn assess_uncached(&self, opportunity: &Opportunity) -> Assessment {
        let score = self.local_score(opportunity);

        if let Some(reason) = self.local_rejection(opportunity) {
            return Assessment {
                accepted: false,
                score,
                advisory_confidence: None,
                reason: Some(reason),
            };
        }

        match self.advisory_opinion(opportunity).await {
            Some(advice) => {
                let accepted = advice.confidence >= self.config.advisory_min_confidence
                    && advice.volume_sufficient;
                Assessment {
                    accepted,
                    score: self.combined_score(score, &advice),
                    advisory_confidence: Some(advice.confidence),
                    reason: (!accepted).then(|| {
                        format!(
                            "advisory veto: confidence {} risk {} volume_ok {}",
                            advice.confidence, advice.risk, advice.volume_sufficient
                        )
                    }),
                }
            }
            // No usable opinion: local checks already passed
            None => Assessment {
                accepted: true,
                score,
                advisory_confidence: None,
                reason: None,
            },
        }
    }

    fn local_rejection(&self, opportunity: &Opportunity) -> Option<String> {
        if opportunity.profit_pct < self.min_profit_pct {
            return Some(format!(
                "profit {}% below minimum {}%",
                opportunity.profit_pct, self.min_profit_pct
            ));
        }
        for leg in &opportunity.legs {
            if leg.available_qty < self.config.min_leg_volume {
                return Some(format!(
                    "{}: volume {} below minimum {}",
                    leg.symbol, leg.available_qty, self.config.min_leg_volume
                ));
            }
            if leg.spread > self.config.max_spread {
                return Some(format!(
                    "{}: spread {} above maximum {}",
                    leg.symbol, leg.spread, self.config.max_spread
                ));
            }
        }
        None
    }

    /// Weighted confidence in `[0, 100]`. Each component is normalized into
    /// `[0, 1]`: profit against five times the entry threshold, volume
    /// against ten times the per-leg minimum, spread inverted against the
    /// per-leg maximum.
    pub fn local_score(&self, opportunity: &Opportunity) -> Decimal {
        let profit_norm = clamp_unit(safe_div(
            opportunity.profit_pct,
            self.min_profit_pct * dec!(5),
        ));
        let volume_norm = clamp_unit(safe_div(
            opportunity.min_leg_volume,
            self.config.min_leg_volume * dec!(10),
        ));
        let spread_norm = Decimal::ONE
            - clamp_unit(safe_div(opportunity.max_leg_spread, self.config.max_spread));

        let weighted = self.config.profit_weight * profit_norm
            + self.config.volume_weight * volume_norm
            + self.config.spread_weight * spread_norm;
        clamp_unit(weighted) * dec!(100)
    }

    /// Equal-weight blend of the local score and the external opinion,
    /// bounded to `[0, 100]`. Risk discounts the advisory half: grade 1
    /// keeps all of it, grade 10 none.
    fn combined_score(&self, local: Decimal, advice: &Advice) -> Decimal {
        let risk = advice.risk.clamp(1, 10);
        let risk_keep = Decimal::from(u32::from(10 - risk)) / dec!(9);
        let advisory = clamp_unit(safe_div(advice.confidence, dec!(100))) * risk_keep;
        clamp_unit((safe_div(local, dec!(100)) + advisory) / dec!(2)) * dec!(100)
    }

    /// External opinion, or `None` when the advisor is unset, over budget,
    /// tripped, timed out, or failed.
    async fn advisory_opinion(&self, opportunity: &Opportunity) -> Option<Advice> {
        let advisor = self.advisor.as_ref()?;

        if self.breaker.check_allowed().is_err() {
            debug!("Advisory circuit open, using local checks only");
            return None;
        }
        if let Err(e) = self.limiter.check_limit(ADVISORY_KEY, ADVISORY_SCOPE, 1) {
            debug!("Advisory rate limit hit, using local checks only: {e}");
            return None;
        }

        let budget = Duration::from_millis(self.config.advisory_timeout_ms);
        match tokio::time::timeout(budget, advisor.analyze(opportunity)).await {
            Ok(Ok(advice)) => {
                self.breaker.record_success();
                Some(advice)
            }
            Ok(Err(e)) => {
                warn!("Advisory call failed, using local checks only: {:#}", e);
                self.breaker.record_failure();
                None
            }
            Err(_) => {
                warn!(?budget, "Advisory call timed out, using local checks only");
                self.breaker.record_failure();
                None
            }
        }
    }
}
