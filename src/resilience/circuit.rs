//! Failure-threshold circuit breaker for unreliable remote calls.

use crate::error::PipelineError;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker states. While `Open`, calls fail immediately without attempting
/// the wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// One breaker per protected call-site.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }

    /// Run the wrapped operation if the breaker allows it.
    pub async fn call<T, Fut>(&self, fut: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.check_allowed()?;

        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Gate a call without running it through `call` (used where the caller
    /// needs to keep its own error type).
    pub fn check_allowed(&self) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    debug!(circuit = %self.name, "Recovery timeout elapsed, probing (half-open)");
                    Ok(())
                } else {
                    Err(PipelineError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            debug!(circuit = %self.name, "Probe succeeded, closing circuit");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.failure_threshold;

        if should_open && inner.state != CircuitState::Open {
            warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                "Opening circuit"
            );
            inner.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn failing() -> anyhow::Result<()> {
        Err(anyhow!("remote unavailable"))
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));

        for _ in 0..3 {
            let _ = breaker.call(async { failing() }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // While open, the wrapped operation is never attempted
        let result = breaker.call(async { Ok::<_, anyhow::Error>(42) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));

        let _ = breaker.call(async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Next call is attempted (half-open) and a single success closes it
        let result = breaker.call(async { Ok::<_, anyhow::Error>(1) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));

        let _ = breaker.call(async { failing() }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker.call(async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(60));

        let _ = breaker.call(async { failing() }).await;
        let _ = breaker.call(async { failing() }).await;
        let _ = breaker.call(async { Ok::<_, anyhow::Error>(()) }).await;
        let _ = breaker.call(async { failing() }).await;

        // Failures were not consecutive, so the circuit stays closed
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
