//! Reconciliation outcome counters
//!
//! Fatal drops are reported as success to the transport, so a counter is
//! the only external evidence they happened. Relaxed ordering is fine:
//! counts are monotonic and only read for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestCounters {
    reconciled: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    retryable: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub reconciled: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub retryable: u64,
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconciled(&self) {
        self.reconciled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retryable(&self) {
        self.retryable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            reconciled: self.reconciled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retryable: self.retryable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let counters = IngestCounters::new();
        counters.record_reconciled();
        counters.record_reconciled();
        counters.record_dropped();

        let snap = counters.snapshot();
        assert_eq!(snap.reconciled, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.skipped, 0);
        assert_eq!(snap.retryable, 0);
    }
}
