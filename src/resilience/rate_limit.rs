//! Sliding-window request budget per (key, scope).
//!
//! The window resets lazily on the first check after expiry, not via a
//! background timer.

use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// A per-scope budget: at most `limit` cost units per `window`.
#[derive(Debug, Clone, Copy)]
pub struct ScopeLimit {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug)]
struct RateWindow {
    requests_in_window: u32,
    window_start: Instant,
}

/// Sliding-window counter keyed by (key, scope).
pub struct RateLimiter {
    limits: HashMap<String, ScopeLimit>,
    windows: Mutex<HashMap<(String, String), RateWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limits: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Register a budget for a scope. Unregistered scopes are unlimited.
    pub fn with_limit(mut self, scope: impl Into<String>, limit: u32, window: Duration) -> Self {
        self.limits.insert(scope.into(), ScopeLimit { limit, window });
        self
    }

    /// Increment the counter for (key, scope) by `cost`, rejecting with a
    /// reset-time hint when the budget would be exceeded.
    pub fn check_limit(&self, key: &str, scope: &str, cost: u32) -> Result<(), PipelineError> {
        let Some(limit) = self.limits.get(scope) else {
            return Ok(());
        };

        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let entry = windows
            .entry((key.to_string(), scope.to_string()))
            .or_insert_with(|| RateWindow {
                requests_in_window: 0,
                window_start: Instant::now(),
            });

        // Lazy window reset
        if entry.window_start.elapsed() >= limit.window {
            entry.requests_in_window = 0;
            entry.window_start = Instant::now();
        }

        if entry.requests_in_window + cost > limit.limit {
            let retry_after = limit
                .window
                .saturating_sub(entry.window_start.elapsed());
            return Err(PipelineError::RateLimited {
                key: key.to_string(),
                scope: scope.to_string(),
                retry_after,
            });
        }

        entry.requests_in_window += cost;
        Ok(())
    }

    /// Wait out the current window if needed, then take the budget. Never
    /// spins: on rejection it sleeps until the hinted reset time.
    pub async fn acquire(&self, key: &str, scope: &str, cost: u32) {
        loop {
            match self.check_limit(key, scope, cost) {
                Ok(()) => return,
                Err(PipelineError::RateLimited { retry_after, .. }) => {
                    warn!(key, scope, ?retry_after, "Rate limit reached, waiting");
                    tokio::time::sleep(retry_after + Duration::from_millis(1)).await;
                }
                Err(_) => unreachable!("check_limit only returns RateLimited"),
            }
        }
    }

    /// Remaining budget for (key, scope) in the current window.
    pub fn remaining(&self, key: &str, scope: &str) -> Option<u32> {
        let limit = self.limits.get(scope)?;
        let windows = self.windows.lock().expect("rate limiter lock poisoned");
        match windows.get(&(key.to_string(), scope.to_string())) {
            Some(w) if w.window_start.elapsed() < limit.window => {
                Some(limit.limit.saturating_sub(w.requests_in_window))
            }
            _ => Some(limit.limit),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
