use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Messages pulled by the listener.
    pub delivered: u64,
    /// Deliveries that resolved a waiter.
    pub matched: u64,
    /// Deliveries with a valid token but no waiter (duplicates, late replies).
    pub unmatched: u64,
    /// Deliveries dropped for lacking a usable `request_id`.
    pub malformed: u64,
    pub pending: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub(crate) issued: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) matched: AtomicU64,
    pub(crate) unmatched: AtomicU64,
    pub(crate) malformed: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize, in_flight: usize) -> EngineStats {
        EngineStats {
            issued: self.issued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            pending,
            in_flight,
        }
    }
}
