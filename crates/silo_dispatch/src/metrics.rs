//! Dispatch counters, kept as relaxed atomics and read out as plain
//! snapshot values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

pub struct StripeMetrics {
    dispatched: AtomicU64,
    queue_timeouts: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    wait_total_us: AtomicU64,
    wait_max_us: AtomicU64,
}

impl StripeMetrics {
    pub(crate) const fn new() -> Self {
        StripeMetrics {
            dispatched: AtomicU64::new(0),
            queue_timeouts: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            wait_total_us: AtomicU64::new(0),
            wait_max_us: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_dispatch(&self, waited: Duration) {
        let us = waited.as_micros().min(u128::from(u64::MAX)) as u64;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.wait_total_us.fetch_add(us, Ordering::Relaxed);
        self.wait_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_timeout(&self) {
        self.queue_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self, count: u64) {
        self.aborted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StripeMetricsSnapshot {
        StripeMetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            wait_total_us: self.wait_total_us.load(Ordering::Relaxed),
            wait_max_us: self.wait_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one stripe's counters.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct StripeMetricsSnapshot {
    /// Messages handed to a worker together with a bucket lock.
    pub dispatched: u64,
    /// Messages reaped from the queue because their own timeout expired.
    pub queue_timeouts: u64,
    /// Messages flushed by an abort command.
    pub aborted: u64,
    /// Messages flushed with an error reply (disk down, remap failure).
    pub failed: u64,
    pub wait_total_us: u64,
    pub wait_max_us: u64,
}

impl StripeMetricsSnapshot {
    pub fn avg_wait_us(&self) -> u64 {
        if self.dispatched == 0 {
            0
        } else {
            self.wait_total_us / self.dispatched
        }
    }

    pub(crate) fn merge(&mut self, other: &StripeMetricsSnapshot) {
        self.dispatched += other.dispatched;
        self.queue_timeouts += other.queue_timeouts;
        self.aborted += other.aborted;
        self.failed += other.failed;
        self.wait_total_us += other.wait_total_us;
        self.wait_max_us = self.wait_max_us.max(other.wait_max_us);
    }
}

/// Per-disk rollup plus the raw per-stripe values.
#[derive(Debug, Clone, Serialize)]
pub struct DiskMetricsSnapshot {
    pub queue_len: usize,
    pub totals: StripeMetricsSnapshot,
    pub stripes: Vec<StripeMetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerMetricsSnapshot {
    pub pending_merges: usize,
    pub disks: Vec<DiskMetricsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_values() {
        let m = StripeMetrics::new();
        m.record_dispatch(Duration::from_micros(300));
        m.record_dispatch(Duration::from_micros(100));
        m.record_queue_timeout();
        let snap = m.snapshot();
        assert_eq!(snap.dispatched, 2);
        assert_eq!(snap.queue_timeouts, 1);
        assert_eq!(snap.wait_total_us, 400);
        assert_eq!(snap.wait_max_us, 300);
        assert_eq!(snap.avg_wait_us(), 200);
    }
}
