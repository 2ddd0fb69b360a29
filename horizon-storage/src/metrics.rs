//! Counters for the read path and the mutation feed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for lazy refresh reads.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    /// Rows served straight from the cache
    pub fresh_hits: AtomicU64,

    /// Rows recomputed from the fact store
    pub recomputes: AtomicU64,

    /// Recomputes that failed to reach the fact store
    pub recompute_failures: AtomicU64,

    /// Recomputes whose commit lost the version race
    pub superseded: AtomicU64,

    /// Recomputes for an instant before the row's own, served uncommitted
    pub historical_reads: AtomicU64,
}

impl RefreshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> RefreshMetricsSnapshot {
        RefreshMetricsSnapshot {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            recomputes: self.recomputes.load(Ordering::Relaxed),
            recompute_failures: self.recompute_failures.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            historical_reads: self.historical_reads.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of refresh metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetricsSnapshot {
    pub fresh_hits: u64,
    pub recomputes: u64,
    pub recompute_failures: u64,
    pub superseded: u64,
    pub historical_reads: u64,
}

impl RefreshMetricsSnapshot {
    /// Share of rows served without a recompute (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.fresh_hits + self.recomputes;
        if total == 0 {
            0.0
        } else {
            self.fresh_hits as f64 / total as f64
        }
    }
}

/// Metrics for the mutation feed consumer.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    /// Events applied to the cache
    pub events_applied: AtomicU64,

    /// Events whose application returned an error
    pub events_failed: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of feed metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedMetricsSnapshot {
    pub events_applied: u64,
    pub events_failed: u64,
}
