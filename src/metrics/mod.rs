//! Pipeline performance counters.
//!
//! One shared `PipelineMetrics` instance is updated by every component and
//! exposed to the outside (dashboard collaborator) as a read-only snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared atomic counters. Cheap to bump from any task.
#[derive(Debug)]
pub struct PipelineMetrics {
    started_at: DateTime<Utc>,
    quotes_received: AtomicU64,
    quotes_rejected: AtomicU64,
    overflow_dropped: AtomicU64,
    reconnects: AtomicU64,
    detection_cycles: AtomicU64,
    last_detection_latency_us: AtomicU64,
    opportunities_detected: AtomicU64,
    opportunities_validated: AtomicU64,
    trades_completed: AtomicU64,
    trades_failed: AtomicU64,
    trades_stopped: AtomicU64,
    cache_size: AtomicUsize,
}

/// Read-only view handed to external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: i64,
    pub quotes_received: u64,
    pub quotes_rejected: u64,
    pub overflow_dropped: u64,
    pub reconnects: u64,
    pub detection_cycles: u64,
    pub last_detection_latency_us: u64,
    pub opportunities_detected: u64,
    pub opportunities_validated: u64,
    pub trades_completed: u64,
    pub trades_failed: u64,
    pub trades_stopped: u64,
    pub cache_size: usize,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            quotes_received: AtomicU64::new(0),
            quotes_rejected: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            detection_cycles: AtomicU64::new(0),
            last_detection_latency_us: AtomicU64::new(0),
            opportunities_detected: AtomicU64::new(0),
            opportunities_validated: AtomicU64::new(0),
            trades_completed: AtomicU64::new(0),
            trades_failed: AtomicU64::new(0),
            trades_stopped: AtomicU64::new(0),
            cache_size: AtomicUsize::new(0),
        }
    }

    pub fn quote_received(&self) {
        self.quotes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quote_rejected(&self) {
        self.quotes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_dropped(&self) {
        self.overflow_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detection_cycle(&self, latency_us: u64, found: u64) {
        self.detection_cycles.fetch_add(1, Ordering::Relaxed);
        self.last_detection_latency_us
            .store(latency_us, Ordering::Relaxed);
        self.opportunities_detected
            .fetch_add(found, Ordering::Relaxed);
    }

    pub fn opportunity_validated(&self) {
        self.opportunities_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_completed(&self) {
        self.trades_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_failed(&self) {
        self.trades_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_stopped(&self) {
        self.trades_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_size(&self, size: usize) {
        self.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            quotes_received: self.quotes_received.load(Ordering::Relaxed),
            quotes_rejected: self.quotes_rejected.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            detection_cycles: self.detection_cycles.load(Ordering::Relaxed),
            last_detection_latency_us: self.last_detection_latency_us.load(Ordering::Relaxed),
            opportunities_detected: self.opportunities_detected.load(Ordering::Relaxed),
            opportunities_validated: self.opportunities_validated.load(Ordering::Relaxed),
            trades_completed: self.trades_completed.load(Ordering::Relaxed),
            trades_failed: self.trades_failed.load(Ordering::Relaxed),
            trades_stopped: self.trades_stopped.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.quote_received();
        metrics.quote_received();
        metrics.quote_rejected();
        metrics.detection_cycle(1234, 3);
        metrics.set_cache_size(42);

        let snap = metrics.snapshot();
        assert_eq!(snap.quotes_received, 2);
        assert_eq!(snap.quotes_rejected, 1);
        assert_eq!(snap.detection_cycles, 1);
        assert_eq!(snap.last_detection_latency_us, 1234);
        assert_eq!(snap.opportunities_detected, 3);
        assert_eq!(snap.cache_size, 42);
    }
}
