//! A single injected metrics record, `Clone`-able and backed entirely by
//! atomics — no process-wide singleton, no global mutable counters.
//!
//! Every component that needs to publish a counter takes a `Metrics`
//! handle at construction, the same way the teacher's daemon threads all
//! share one `Arc<AppState>` rather than reaching for `lazy_static`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    queue_depth: AtomicI64,
    busy_backoff_total: AtomicU64,
    recovery_total: AtomicU64,
    recovery_failures_total: AtomicU64,
    commits_total: AtomicU64,
    rows_persisted_total: AtomicU64,
    rows_ignored_total: AtomicU64,
    drops_queue_full_total: AtomicU64,
    drops_mapping_error_total: AtomicU64,
    drops_stale_seq_total: AtomicU64,
    /// Monotonic timestamp of the most recent newly-accepted (non-
    /// duplicate) row from push or poll; `0` means none yet. Backs the
    /// watchdog's "upstream active within window" signal, which must
    /// exclude duplicate-only windows (spec.md §4.7).
    last_accept_monotonic_ms: AtomicU64,
}

/// `u64::MAX` would read as "active" under any window, so the sentinel
/// for "never accepted anything" must be a value a real `monotonic_ms()`
/// reading can never collide with: `0` is safe since every clock is
/// anchored at process start.
const NEVER: u64 = 0;

/// Reasons a row never reaches the day store, for per-reason drop
/// accounting (spec.md §4.6's "dropped by reason" poll statistic, and the
/// push path's overflow drop counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    MappingError,
    StaleSeq,
}

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Counters>,
}

/// A point-in-time copy of every counter, for heartbeat/health logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_depth: i64,
    pub busy_backoff_total: u64,
    pub recovery_total: u64,
    pub recovery_failures_total: u64,
    pub commits_total: u64,
    pub rows_persisted_total: u64,
    pub rows_ignored_total: u64,
    pub drops_queue_full_total: u64,
    pub drops_mapping_error_total: u64,
    pub drops_stale_seq_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters::default()),
        }
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn inc_busy_backoff(&self) {
        self.inner.busy_backoff_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recovery(&self) {
        self.inner.recovery_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recovery_failure(&self) {
        self.inner
            .recovery_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_recovery_failures(&self) {
        self.inner.recovery_failures_total.store(0, Ordering::Relaxed);
    }

    /// Record that a non-duplicate row was just accepted (from either the
    /// push or the poll path), at the given monotonic instant. The
    /// lifecycle coordinator's health loop derives
    /// `upstream_active_within_window` from [`Self::last_accept_age_ms`]
    /// so that duplicate-only activity never reads as upstream activity.
    pub fn record_accept(&self, now_monotonic_ms: u64) {
        // A fresh accept always advances the marker forward in time;
        // callers only ever pass an increasing clock reading.
        self.inner
            .last_accept_monotonic_ms
            .store(now_monotonic_ms.max(1), Ordering::Relaxed);
    }

    /// Milliseconds since the last non-duplicate accept, or `None` if
    /// nothing has ever been accepted.
    pub fn last_accept_age_ms(&self, now_monotonic_ms: u64) -> Option<u64> {
        match self.inner.last_accept_monotonic_ms.load(Ordering::Relaxed) {
            NEVER => None,
            last => Some(now_monotonic_ms.saturating_sub(last)),
        }
    }

    pub fn record_commit(&self, inserted: u64, ignored: u64) {
        self.inner.commits_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .rows_persisted_total
            .fetch_add(inserted, Ordering::Relaxed);
        self.inner
            .rows_ignored_total
            .fetch_add(ignored, Ordering::Relaxed);
    }

    pub fn inc_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::QueueFull => &self.inner.drops_queue_full_total,
            DropReason::MappingError => &self.inner.drops_mapping_error_total,
            DropReason::StaleSeq => &self.inner.drops_stale_seq_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            busy_backoff_total: self.inner.busy_backoff_total.load(Ordering::Relaxed),
            recovery_total: self.inner.recovery_total.load(Ordering::Relaxed),
            recovery_failures_total: self.inner.recovery_failures_total.load(Ordering::Relaxed),
            commits_total: self.inner.commits_total.load(Ordering::Relaxed),
            rows_persisted_total: self.inner.rows_persisted_total.load(Ordering::Relaxed),
            rows_ignored_total: self.inner.rows_ignored_total.load(Ordering::Relaxed),
            drops_queue_full_total: self.inner.drops_queue_full_total.load(Ordering::Relaxed),
            drops_mapping_error_total: self
                .inner
                .drops_mapping_error_total
                .load(Ordering::Relaxed),
            drops_stale_seq_total: self.inner.drops_stale_seq_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let s = m.snapshot();
        assert_eq!(s.commits_total, 0);
        assert_eq!(s.queue_depth, 0);
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let m = Metrics::new();
        let m2 = m.clone();
        m2.inc_recovery();
        assert_eq!(m.snapshot().recovery_total, 1);
    }

    #[test]
    fn record_commit_accumulates_inserted_and_ignored() {
        let m = Metrics::new();
        m.record_commit(3, 2);
        m.record_commit(1, 0);
        let s = m.snapshot();
        assert_eq!(s.commits_total, 2);
        assert_eq!(s.rows_persisted_total, 4);
        assert_eq!(s.rows_ignored_total, 2);
    }

    #[test]
    fn drop_reasons_are_tracked_independently() {
        let m = Metrics::new();
        m.inc_drop(DropReason::QueueFull);
        m.inc_drop(DropReason::QueueFull);
        m.inc_drop(DropReason::MappingError);
        let s = m.snapshot();
        assert_eq!(s.drops_queue_full_total, 2);
        assert_eq!(s.drops_mapping_error_total, 1);
        assert_eq!(s.drops_stale_seq_total, 0);
    }

    #[test]
    fn last_accept_age_is_none_until_first_accept() {
        let m = Metrics::new();
        assert_eq!(m.last_accept_age_ms(1_000), None);
        m.record_accept(400);
        assert_eq!(m.last_accept_age_ms(1_000), Some(600));
    }

    #[test]
    fn recovery_failures_reset_on_success() {
        let m = Metrics::new();
        m.inc_recovery_failure();
        m.inc_recovery_failure();
        assert_eq!(m.snapshot().recovery_failures_total, 2);
        m.reset_recovery_failures();
        assert_eq!(m.snapshot().recovery_failures_total, 0);
    }
}
