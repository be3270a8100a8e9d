//! Lock-free query statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct QueryStats {
    total: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    rows: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

/// Point-in-time copy of [`QueryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub total_rows: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl StatsSnapshot {
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_queries as f64
        }
    }
}

impl QueryStats {
    /// Record one statement. Returns whether it counted as slow.
    pub fn record(&self, elapsed: Duration, rows: u64, ok: bool, slow_threshold: Duration) -> bool {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let slow = elapsed >= slow_threshold;
        if slow {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
        slow
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_queries: self.total.load(Ordering::Relaxed),
            failed_queries: self.failed.load(Ordering::Relaxed),
            slow_queries: self.slow.load(Ordering::Relaxed),
            total_rows: self.rows.load(Ordering::Relaxed),
            total_duration_ms: self.total_micros.load(Ordering::Relaxed) / 1_000,
            max_duration_ms: self.max_micros.load(Ordering::Relaxed) / 1_000,
        }
    }
}
