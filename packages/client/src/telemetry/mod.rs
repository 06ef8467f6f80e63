//! Scheduler counters for monitoring
//!
//! Relaxed atomic counters updated on the hot paths; read out as a consistent
//! snapshot only on demand.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub requests_submitted: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub sub_requests_dispatched: AtomicU64,
    pub sub_requests_completed: AtomicU64,
    pub splits_planned: AtomicU64,
    pub prestarts_fired: AtomicU64,
    pub bytes_delivered: AtomicU64,
}

impl SchedulerStats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sub_requests(&self, n: u64) {
        self.sub_requests_dispatched.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sub_request_completed(&self) {
        self.sub_requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_split(&self) {
        self.splits_planned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_prestart(&self) {
        self.prestarts_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_bytes(&self, n: u64) {
        self.bytes_delivered.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            sub_requests_dispatched: self.sub_requests_dispatched.load(Ordering::Relaxed),
            sub_requests_completed: self.sub_requests_completed.load(Ordering::Relaxed),
            splits_planned: self.splits_planned.load(Ordering::Relaxed),
            prestarts_fired: self.prestarts_fired.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub sub_requests_dispatched: u64,
    pub sub_requests_completed: u64,
    pub splits_planned: u64,
    pub prestarts_fired: u64,
    pub bytes_delivered: u64,
}
