//! Bounded single-consumer handoff between producer callbacks (push and
//! poll) and the persistence worker.
//!
//! Wraps `crossbeam-channel` rather than exposing it directly, so callers
//! can only reach it through `offer`/`drain_batch` — mirroring the
//! teacher's pattern of wrapping a shared channel in a purpose-built
//! struct instead of handing out the raw sender/receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use hkmd_model::Tick;

/// Default bound, per the Bounded Queue contract.
pub const DEFAULT_CAPACITY: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    Accepted,
    Full,
}

/// A bounded MPMC handoff; in practice many producers (push callbacks,
/// the poll loop) and exactly one consumer (the persistence worker).
pub struct TickQueue {
    tx: Sender<Tick>,
    rx: Receiver<Tick>,
    overflow_count: AtomicU64,
}

impl TickQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            overflow_count: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Non-blocking offer. On `Full`, returns immediately and increments
    /// the overflow counter; the caller is responsible for rolling back
    /// any sequence-state advance it made in anticipation of acceptance.
    pub fn offer(&self, tick: Tick) -> OfferResult {
        match self.tx.try_send(tick) {
            Ok(()) => OfferResult::Accepted,
            Err(TrySendError::Full(_)) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                OfferResult::Full
            }
            Err(TrySendError::Disconnected(_)) => {
                // The only receiver is the persistence worker; a
                // disconnected channel means it has already shut down.
                // Treat identically to full — there is no reader to hand
                // the row to, and the poll path will re-surface it.
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                OfferResult::Full
            }
        }
    }

    /// Block up to `max_wait` or until `max_size` rows are available,
    /// whichever comes first. Returns at least one row if any arrive
    /// within the wait; returns empty only on timeout with nothing
    /// available.
    pub fn drain_batch(&self, max_size: usize, max_wait: Duration) -> Vec<Tick> {
        let mut batch = Vec::with_capacity(max_size.min(64));
        let deadline = Instant::now() + max_wait;

        // Block for the first row (or until the deadline) so a quiet
        // queue doesn't spin the worker thread.
        match self.rx.recv_deadline(deadline) {
            Ok(tick) => batch.push(tick),
            Err(_) => return batch,
        }

        // Drain whatever else is immediately available without
        // re-blocking, up to max_size.
        while batch.len() < max_size {
            match self.rx.try_recv() {
                Ok(tick) => batch.push(tick),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        batch
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Approximate current depth, for health sampling. `crossbeam_channel`
    /// exposes this directly and cheaply.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkmd_model::Tick;

    fn sample_tick(seq: Option<i64>) -> Tick {
        Tick {
            market: "HK".into(),
            symbol: "00700".into(),
            ts_ms: 1_770_000_000_000,
            recv_ts_ms: 1_770_000_000_000,
            price: None,
            volume: None,
            turnover: None,
            direction: None,
            tick_type: None,
            push_type: None,
            provider: None,
            seq,
            trading_day: "20260212".into(),
            inserted_at_ms: None,
        }
    }

    #[test]
    fn offer_accepts_until_capacity_then_reports_full() {
        let q = TickQueue::new(2);
        assert_eq!(q.offer(sample_tick(Some(1))), OfferResult::Accepted);
        assert_eq!(q.offer(sample_tick(Some(2))), OfferResult::Accepted);
        assert_eq!(q.offer(sample_tick(Some(3))), OfferResult::Full);
        assert_eq!(q.overflow_count(), 1);
    }

    #[test]
    fn drain_batch_returns_up_to_max_size_without_reblocking() {
        let q = TickQueue::new(10);
        for i in 0..5 {
            q.offer(sample_tick(Some(i)));
        }
        let batch = q.drain_batch(3, Duration::from_millis(50));
        assert_eq!(batch.len(), 3);
        let rest = q.drain_batch(10, Duration::from_millis(50));
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn drain_batch_times_out_empty_when_nothing_arrives() {
        let q = TickQueue::new(10);
        let batch = q.drain_batch(10, Duration::from_millis(20));
        assert!(batch.is_empty());
    }

    #[test]
    fn drain_batch_returns_at_least_one_row_if_present_within_wait() {
        let q = TickQueue::new(10);
        q.offer(sample_tick(None));
        let batch = q.drain_batch(10, Duration::from_secs(1));
        assert_eq!(batch.len(), 1);
    }
}
