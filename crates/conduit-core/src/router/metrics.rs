//! Per-consumer processing counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    unknown: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub unknown: u64,
    pub dead_lettered: u64,
    /// Left for redelivery because another worker holds the run.
    pub deferred: u64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Timeouts also count as failures.
    pub(crate) fn record_timeout(&self) {
        self.record_failure();
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Unknown message types also count as failures.
    pub(crate) fn record_unknown(&self) {
        self.record_failure();
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Deferred messages are not processed yet; they come back later.
    pub(crate) fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_unknowns_are_failures() {
        let metrics = ConsumerMetrics::new();
        metrics.record_success();
        metrics.record_timeout();
        metrics.record_unknown();
        metrics.record_dead_letter();
        metrics.record_deferred();

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.unknown, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.deferred, 1);
    }
}
