//! Sink counters and batch timing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Shared counters updated by the emit path and the partition workers.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Rows accepted by the emit path (after filtering).
    row_count: AtomicU64,
    /// Batches handed to the producer.
    batch_count: AtomicU64,
    /// Rows contained in those batches.
    flushed_row_count: AtomicU64,
    /// Cumulative time spent writing batches to the producer.
    batch_nanos: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub row_count: u64,
    pub batch_count: u64,
    pub flushed_row_count: u64,
    pub total_batch_time: Duration,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rows_count(&self, rows: usize) {
        self.row_count.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn observe_batch(&self, rows: usize, elapsed: Duration) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.flushed_row_count
            .fetch_add(rows as u64, Ordering::Relaxed);
        self.batch_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            row_count: self.row_count.load(Ordering::Relaxed),
            batch_count: self.batch_count.load(Ordering::Relaxed),
            flushed_row_count: self.flushed_row_count.load(Ordering::Relaxed),
            total_batch_time: Duration::from_nanos(self.batch_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Logs a status line; called when the checkpoint advances.
    pub fn print_status(&self) {
        let snapshot = self.snapshot();
        let avg_batch_micros = if snapshot.batch_count > 0 {
            snapshot.total_batch_time.as_micros() as u64 / snapshot.batch_count
        } else {
            0
        };
        info!(
            rows = snapshot.row_count,
            batches = snapshot.batch_count,
            flushed_rows = snapshot.flushed_row_count,
            avg_batch_micros,
            "mq sink status"
        );
    }
}
