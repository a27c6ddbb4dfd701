//! Per-`(market, symbol)` sequence-tracking state.
//!
//! Mirrors the shape of the teacher's `IntegrityState`: a map keyed by feed
//! identity holding a small piece of state, mutated only through named,
//! invariant-preserving methods — never by direct field access from
//! outside this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Key identifying one sequence-tracked stream.
pub type SymbolKey = (String, String);

/// The `{seen, accepted, persisted}` triple for one symbol.
///
/// Invariant: `persisted_seq <= accepted_seq <= seen_seq` whenever all
/// three are `Some`. `seen_seq` is advisory only (observability, poll
/// staleness); `accepted_seq`/`persisted_seq` gate real behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqState {
    pub seen_seq: Option<i64>,
    pub accepted_seq: Option<i64>,
    pub persisted_seq: Option<i64>,
    /// Snapshot of `accepted_seq` immediately before the most recent
    /// successful `try_accept`, so a following `rollback_accept` for that
    /// same seq can restore it exactly. A rollback is a no-op if another
    /// `try_accept` has advanced `accepted_seq` further in the meantime —
    /// the later advance wins and the stale rollback is simply dropped.
    accepted_seq_before: Option<i64>,
}

impl SeqState {
    fn baseline(&self) -> Option<i64> {
        match (self.accepted_seq, self.persisted_seq) {
            (None, None) => None,
            (a, p) => Some(a.unwrap_or(i64::MIN).max(p.unwrap_or(i64::MIN))),
        }
    }
}

/// Thread-safe table of [`SeqState`], one per `(market, symbol)`.
///
/// Accessed concurrently from the push-callback path, the poll loop, and
/// the persistence worker; a single mutex over the whole map is
/// sufficient since every operation here is O(1) and non-blocking.
#[derive(Clone, Default)]
pub struct SeqTracker {
    inner: Arc<Mutex<HashMap<SymbolKey, SeqState>>>,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Advance `seen_seq` to `max(seen_seq, seq)`. Advisory only; never
    /// rejected, never gates anything downstream.
    pub fn observe(&self, market: &str, symbol: &str, seq: Option<i64>) {
        let Some(seq) = seq else { return };
        let mut map = self.lock();
        let state = map.entry(key(market, symbol)).or_default();
        state.seen_seq = Some(state.seen_seq.map_or(seq, |s| s.max(seq)));
    }

    /// Returns `true` when `seq` is null (composite-key rows, always
    /// accepted) or strictly greater than the current `accepted_seq`. On
    /// `true` for a non-null `seq`, pre-advances `accepted_seq` so a
    /// concurrent caller sees the reservation immediately; a null `seq`
    /// never touches `accepted_seq` at all, per the composite-key dedupe
    /// rule (those rows never advance `accepted_seq`/`persisted_seq`).
    pub fn try_accept(&self, market: &str, symbol: &str, seq: Option<i64>) -> bool {
        let Some(seq) = seq else { return true };
        let mut map = self.lock();
        let state = map.entry(key(market, symbol)).or_default();
        let accepted = match state.accepted_seq {
            None => true,
            Some(current) => seq > current,
        };
        if accepted {
            state.accepted_seq_before = state.accepted_seq;
            state.accepted_seq = Some(seq);
        }
        accepted
    }

    /// Undo a `try_accept(symbol, seq)` whose subsequent queue offer
    /// failed. No-op if `seq` is null, or if `accepted_seq` no longer
    /// equals `seq` (superseded by a later accept in the meantime).
    pub fn rollback_accept(&self, market: &str, symbol: &str, seq: Option<i64>) {
        let Some(seq) = seq else { return };
        let mut map = self.lock();
        if let Some(state) = map.get_mut(&key(market, symbol)) {
            if state.accepted_seq == Some(seq) {
                state.accepted_seq = state.accepted_seq_before;
            }
        }
    }

    /// Advance `persisted_seq` to `max(persisted_seq, seq)`. Called once
    /// per symbol with the maximum `seq` committed in a batch; a null
    /// `seq` is a no-op.
    pub fn mark_persisted(&self, market: &str, symbol: &str, seq: Option<i64>) {
        let Some(seq) = seq else { return };
        let mut map = self.lock();
        let state = map.entry(key(market, symbol)).or_default();
        state.persisted_seq = Some(state.persisted_seq.map_or(seq, |p| p.max(seq)));
    }

    /// `max(accepted_seq, persisted_seq)`, or `None` for an unknown
    /// symbol or one that has never accepted/persisted a numeric `seq`.
    pub fn baseline(&self, market: &str, symbol: &str) -> Option<i64> {
        let map = self.lock();
        map.get(&key(market, symbol)).and_then(SeqState::baseline)
    }

    /// A snapshot copy of the current state for a symbol, for tests and
    /// diagnostics. Never mutated via the returned value.
    pub fn snapshot(&self, market: &str, symbol: &str) -> SeqState {
        let map = self.lock();
        map.get(&key(market, symbol)).copied().unwrap_or_default()
    }

    /// Seed `accepted_seq` and `persisted_seq` for a symbol from a
    /// recovered maximum, without disturbing `seen_seq`. Used by the
    /// lifecycle coordinator when scanning recent day files on startup.
    pub fn seed(&self, market: &str, symbol: &str, max_seq: i64) {
        let mut map = self.lock();
        let state = map.entry(key(market, symbol)).or_default();
        state.accepted_seq = Some(state.accepted_seq.map_or(max_seq, |a| a.max(max_seq)));
        state.persisted_seq = Some(state.persisted_seq.map_or(max_seq, |p| p.max(max_seq)));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SymbolKey, SeqState>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key(market: &str, symbol: &str) -> SymbolKey {
    (market.to_string(), symbol.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_advances_seen_seq_only() {
        let t = SeqTracker::new();
        t.observe("HK", "00700", Some(5));
        t.observe("HK", "00700", Some(3));
        let s = t.snapshot("HK", "00700");
        assert_eq!(s.seen_seq, Some(5));
        assert_eq!(s.accepted_seq, None);
    }

    #[test]
    fn try_accept_requires_strictly_greater_seq() {
        let t = SeqTracker::new();
        assert!(t.try_accept("HK", "00700", Some(1)));
        assert!(t.try_accept("HK", "00700", Some(2)));
        assert!(!t.try_accept("HK", "00700", Some(2)));
        assert!(!t.try_accept("HK", "00700", Some(1)));
        assert_eq!(t.snapshot("HK", "00700").accepted_seq, Some(2));
    }

    #[test]
    fn null_seq_always_accepted_and_never_advances_accepted_seq() {
        let t = SeqTracker::new();
        assert!(t.try_accept("HK", "00700", None));
        assert!(t.try_accept("HK", "00700", None));
        let s = t.snapshot("HK", "00700");
        assert_eq!(s.accepted_seq, None);
        assert_eq!(s.persisted_seq, None);
    }

    #[test]
    fn rollback_restores_prior_accepted_seq() {
        let t = SeqTracker::new();
        assert!(t.try_accept("HK", "00700", Some(10)));
        assert!(t.try_accept("HK", "00700", Some(11)));
        t.rollback_accept("HK", "00700", Some(11));
        assert_eq!(t.snapshot("HK", "00700").accepted_seq, Some(10));
    }

    #[test]
    fn rollback_is_noop_if_superseded() {
        let t = SeqTracker::new();
        assert!(t.try_accept("HK", "00700", Some(10)));
        assert!(t.try_accept("HK", "00700", Some(11)));
        // A later accept moved accepted_seq to 12 before the rollback for
        // 11 arrives; the rollback must not clobber it.
        assert!(t.try_accept("HK", "00700", Some(12)));
        t.rollback_accept("HK", "00700", Some(11));
        assert_eq!(t.snapshot("HK", "00700").accepted_seq, Some(12));
    }

    #[test]
    fn mark_persisted_advances_to_max_and_baseline_uses_max_of_both() {
        let t = SeqTracker::new();
        t.try_accept("HK", "00700", Some(5));
        t.mark_persisted("HK", "00700", Some(3));
        assert_eq!(t.baseline("HK", "00700"), Some(5));
        t.mark_persisted("HK", "00700", Some(5));
        assert_eq!(t.snapshot("HK", "00700").persisted_seq, Some(5));
        assert_eq!(t.baseline("HK", "00700"), Some(5));
    }

    #[test]
    fn baseline_of_unknown_symbol_is_none() {
        let t = SeqTracker::new();
        assert_eq!(t.baseline("HK", "nope"), None);
    }

    #[test]
    fn seed_only_raises_accepted_and_persisted() {
        let t = SeqTracker::new();
        t.seed("HK", "00700", 100);
        assert_eq!(t.baseline("HK", "00700"), Some(100));
        t.seed("HK", "00700", 50);
        assert_eq!(t.baseline("HK", "00700"), Some(100));
    }

    #[test]
    fn monotonicity_holds_across_a_mixed_sequence() {
        let t = SeqTracker::new();
        t.observe("HK", "00700", Some(1));
        assert!(t.try_accept("HK", "00700", Some(1)));
        t.mark_persisted("HK", "00700", Some(1));
        let s = t.snapshot("HK", "00700");
        assert!(s.persisted_seq.unwrap() <= s.accepted_seq.unwrap());
        assert!(s.accepted_seq.unwrap() <= s.seen_seq.unwrap());
    }
}
