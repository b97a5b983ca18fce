//! Counters for admission outcomes and swallowed failures.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide limiter counters.
///
/// Failures that resolve to a permissive outcome (store outages under
/// fail-open, unreadable credentials treated as anonymous) are counted here
/// so they stay visible.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    admitted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
    identity_failures: AtomicU64,
    cas_conflicts: AtomicU64,
}

/// Point-in-time copy of [`LimiterMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub store_failures: u64,
    pub identity_failures: u64,
    pub cas_conflicts: u64,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_failure(&self) {
        self.identity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cas_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            identity_failures: self.identity_failures.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
        }
    }
}
