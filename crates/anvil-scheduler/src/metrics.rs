//! Metrics collection for the scheduler

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Real-time counters updated by the enqueue path and the workers
///
/// Lock-free; a consistent point-in-time view is taken with [`snapshot`].
///
/// [`snapshot`]: SchedulerMetricsCollector::snapshot
pub struct SchedulerMetricsCollector {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    displaced: AtomicU64,
    timed_out: AtomicU64,
    shape_mismatches: AtomicU64,
    batches_executed: AtomicU64,
    batch_failures: AtomicU64,
    requests_dispatched: AtomicU64,
    total_batch_size: AtomicU64,
    drained_at_shutdown: AtomicU64,
    start_time: Instant,
}

/// Point-in-time view of the collector
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Requests accepted into the queue
    pub enqueued: u64,
    /// Requests rejected at enqueue (full level or bad priority)
    pub rejected: u64,
    /// Requests displaced out of a full level
    pub displaced: u64,
    /// Requests that expired in the queue
    pub timed_out: u64,
    /// Requests evicted for incompatible declared shapes
    pub shape_mismatches: u64,
    /// Batches handed to the execution callable
    pub batches_executed: u64,
    /// Batches whose execution reported a batch-level failure
    pub batch_failures: u64,
    /// Requests dispatched inside those batches
    pub requests_dispatched: u64,
    /// Mean requests per executed batch
    pub avg_batch_size: f64,
    /// Dispatch throughput in requests per second since creation
    pub throughput_rps: f64,
    /// Residual requests failed during shutdown
    pub drained_at_shutdown: u64,
}

impl SchedulerMetricsCollector {
    pub fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            displaced: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            shape_mismatches: AtomicU64::new(0),
            batches_executed: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            total_batch_size: AtomicU64::new(0),
            drained_at_shutdown: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_displaced(&self) {
        self.displaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shape_mismatch(&self) {
        self.shape_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_executed(&self, batch_size: usize, failed: bool) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.requests_dispatched
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        self.total_batch_size
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        if failed {
            self.batch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drained(&self, count: usize) {
        self.drained_at_shutdown
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Take a point-in-time view with derived averages
    pub fn snapshot(&self) -> MetricsSnapshot {
        let batches = self.batches_executed.load(Ordering::Relaxed);
        let dispatched = self.requests_dispatched.load(Ordering::Relaxed);
        let total_size = self.total_batch_size.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs_f64();

        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            shape_mismatches: self.shape_mismatches.load(Ordering::Relaxed),
            batches_executed: batches,
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            requests_dispatched: dispatched,
            avg_batch_size: if batches > 0 {
                total_size as f64 / batches as f64
            } else {
                0.0
            },
            throughput_rps: if uptime > 0.0 {
                dispatched as f64 / uptime
            } else {
                0.0
            },
            drained_at_shutdown: self.drained_at_shutdown.load(Ordering::Relaxed),
        }
    }
}

impl Default for SchedulerMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_averages() {
        let collector = SchedulerMetricsCollector::new();
        collector.record_batch_executed(4, false);
        collector.record_batch_executed(2, true);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.batches_executed, 2);
        assert_eq!(snapshot.batch_failures, 1);
        assert_eq!(snapshot.requests_dispatched, 6);
        assert!((snapshot.avg_batch_size - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_collector_reports_zeroes() {
        let snapshot = SchedulerMetricsCollector::new().snapshot();
        assert_eq!(snapshot.enqueued, 0);
        assert_eq!(snapshot.avg_batch_size, 0.0);
    }
}
