//! In-process test doubles shared across the workspace's integration
//! tests: a deterministic [`TestClock`], a scriptable [`FakeGateway`],
//! and a [`TempDataRoot`] convenience wrapper.
//!
//! Grounded on the teacher's `mqk-testkit::recovery::FakeBroker` — a
//! minimal in-memory double satisfying a production trait, compiled only
//! under `#[cfg(test)]`/dev-dependencies, never shipped in the production
//! binary.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use hkmd_clock::Clock;
use hkmd_gateway::{GatewayError, PushSink, QuoteGateway};
use hkmd_model::RawRow;

/// A [`Clock`] whose monotonic and wall-clock readings are only ever
/// advanced explicitly by the test, never by real elapsed time — so
/// liveness/stall assertions never race the test process's own speed.
pub struct TestClock {
    monotonic_ms: AtomicU64,
    utc_ms: AtomicI64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            monotonic_ms: AtomicU64::new(0),
            utc_ms: AtomicI64::new(0),
        }
    }

    pub fn at(monotonic_ms: u64, utc_ms: i64) -> Self {
        Self {
            monotonic_ms: AtomicU64::new(monotonic_ms),
            utc_ms: AtomicI64::new(utc_ms),
        }
    }

    /// Advance both the monotonic and wall clocks by the same delta, as a
    /// real clock would between two calls.
    pub fn advance(&self, delta_ms: u64) {
        self.monotonic_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.utc_ms.fetch_add(delta_ms as i64, Ordering::SeqCst);
    }

    pub fn set_utc_ms(&self, utc_ms: i64) {
        self.utc_ms.store(utc_ms, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.utc_ms.load(Ordering::SeqCst))
            .single()
            .expect("test clock millis must be representable")
    }

    fn monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}

type SymbolKey = (String, String);

#[derive(Default)]
struct FakeGatewayState {
    sink: Option<Arc<dyn PushSink>>,
    connect_count: u32,
    subscribed_symbols: Vec<SymbolKey>,
    poll_responses: HashMap<SymbolKey, VecDeque<Vec<RawRow>>>,
    backfill_responses: HashMap<SymbolKey, VecDeque<Vec<RawRow>>>,
    pending_disconnect: Option<GatewayError>,
}

/// A scriptable [`QuoteGateway`] double. Tests queue up poll/backfill
/// responses ahead of time and push rows directly through the registered
/// [`PushSink`] once `connect` has run, mirroring how a real gateway
/// client would invoke the driver's callback on its own thread.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
    disconnect_notify: Notify,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeGatewayState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    pub fn subscribed_symbols(&self) -> Vec<SymbolKey> {
        self.lock().subscribed_symbols.clone()
    }

    /// Queue one poll response for `(market, symbol)`; successive calls
    /// to `poll_recent` for that key pop responses in FIFO order, then
    /// fall back to an empty `Vec` once exhausted.
    pub fn queue_poll_response(&self, market: &str, symbol: &str, rows: Vec<RawRow>) {
        self.lock()
            .poll_responses
            .entry((market.to_string(), symbol.to_string()))
            .or_default()
            .push_back(rows);
    }

    pub fn queue_backfill_response(&self, market: &str, symbol: &str, rows: Vec<RawRow>) {
        self.lock()
            .backfill_responses
            .entry((market.to_string(), symbol.to_string()))
            .or_default()
            .push_back(rows);
    }

    /// Deliver a push batch through the sink registered at `connect`
    /// time. Panics if nothing has connected yet — a test bug, not a
    /// runtime condition this double should paper over.
    pub async fn push_batch(&self, rows: Vec<RawRow>) {
        let sink = self
            .lock()
            .sink
            .clone()
            .expect("FakeGateway::push_batch called before connect()");
        sink.on_push_batch(rows).await;
    }

    /// Cause the next (or current) `wait_for_disconnect` call to resolve
    /// with `reason`, simulating an upstream drop.
    pub fn trigger_disconnect(&self, reason: GatewayError) {
        self.lock().pending_disconnect = Some(reason);
        self.disconnect_notify.notify_waiters();
    }
}

#[async_trait]
impl QuoteGateway for FakeGateway {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn connect(&self, sink: Arc<dyn PushSink>) -> Result<(), GatewayError> {
        let mut state = self.lock();
        state.sink = Some(sink);
        state.connect_count += 1;
        Ok(())
    }

    async fn subscribe(&self, symbols: &[(String, String)]) -> Result<(), GatewayError> {
        self.lock().subscribed_symbols = symbols.to_vec();
        Ok(())
    }

    async fn wait_for_disconnect(&self) -> GatewayError {
        loop {
            if let Some(reason) = self.lock().pending_disconnect.take() {
                return reason;
            }
            self.disconnect_notify.notified().await;
        }
    }

    async fn poll_recent(
        &self,
        market: &str,
        symbol: &str,
        _n: usize,
    ) -> Result<Vec<RawRow>, GatewayError> {
        let mut state = self.lock();
        let rows = state
            .poll_responses
            .get_mut(&(market.to_string(), symbol.to_string()))
            .and_then(|q| q.pop_front())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn backfill(
        &self,
        market: &str,
        symbol: &str,
        _n: usize,
    ) -> Result<Vec<RawRow>, GatewayError> {
        let mut state = self.lock();
        let rows = state
            .backfill_responses
            .get_mut(&(market.to_string(), symbol.to_string()))
            .and_then(|q| q.pop_front())
            .unwrap_or_default();
        Ok(rows)
    }
}

/// A temp directory scoped to one test's day-store files, deleted on
/// drop. Thin wrapper so call sites read `TempDataRoot::new().path()`
/// instead of juggling `tempfile::TempDir` directly everywhere.
pub struct TempDataRoot {
    dir: tempfile::TempDir,
}

impl TempDataRoot {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp data root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TempDataRoot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_faces_together() {
        let clock = TestClock::at(1_000, 2_000);
        clock.advance(500);
        assert_eq!(clock.monotonic_ms(), 1_500);
        assert_eq!(clock.now_utc().timestamp_millis(), 2_500);
    }

    #[tokio::test]
    async fn fake_gateway_replays_queued_poll_responses_in_order() {
        let gw = FakeGateway::new();
        gw.queue_poll_response("HK", "00700", vec![RawRow::new().set("seq", 1i64)]);
        gw.queue_poll_response("HK", "00700", vec![RawRow::new().set("seq", 2i64)]);

        let first = gw.poll_recent("HK", "00700", 100).await.unwrap();
        assert_eq!(first[0].get("seq").unwrap().as_i64(), Some(1));
        let second = gw.poll_recent("HK", "00700", 100).await.unwrap();
        assert_eq!(second[0].get("seq").unwrap().as_i64(), Some(2));
        let third = gw.poll_recent("HK", "00700", 100).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn fake_gateway_disconnect_resolves_wait() {
        let gw = FakeGateway::new();
        gw.trigger_disconnect(GatewayError::Disconnected);
        let reason = gw.wait_for_disconnect().await;
        assert!(matches!(reason, GatewayError::Disconnected));
    }
}
