//! Upstream driver: the `QuoteGateway` trait boundary, push-callback
//! routing, the poll fallback loop, and reconnect backoff.
//!
//! Grounded on the teacher's `mqk-md::provider` object-safe `Provider`
//! trait (`fetch_historical`/`fetch_latest` split) generalized into
//! `subscribe`/`poll_recent`/`backfill`; the gateway client itself is an
//! out-of-scope external collaborator (spec.md §1), so this crate only
//! models the boundary and the routing logic around it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use hkmd_clock::Clock;
use hkmd_metrics::{DropReason, Metrics};
use hkmd_model::{map_row, RawRow, Tick};
use hkmd_queue::{OfferResult, TickQueue};
use hkmd_seqstate::SeqTracker;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("disconnected")]
    Disconnected,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("gateway error: {0}")]
    Other(String),
}

/// Callback boundary the gateway pushes batches through. Kept separate
/// from `QuoteGateway` so a gateway implementation can hold the sink
/// independently of whatever internal reconnect state it manages.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn on_push_batch(&self, rows: Vec<RawRow>);
}

/// Pluggable upstream quote gateway. The real implementation (the
/// external collaborator) lives outside this crate; tests substitute
/// `hkmd-testsupport::FakeGateway`.
#[async_trait]
pub trait QuoteGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish the connection and register `sink` for push callbacks.
    async fn connect(&self, sink: Arc<dyn PushSink>) -> Result<(), GatewayError>;

    /// Subscribe to the tick stream for the given `(market, symbol)`
    /// universe.
    async fn subscribe(&self, symbols: &[(String, String)]) -> Result<(), GatewayError>;

    /// Resolves once the connection drops, with the reason.
    async fn wait_for_disconnect(&self) -> GatewayError;

    /// Fetch the most recent `n` rows for one symbol (poll fallback).
    async fn poll_recent(
        &self,
        market: &str,
        symbol: &str,
        n: usize,
    ) -> Result<Vec<RawRow>, GatewayError>;

    /// Fetch up to `n` recent rows for one symbol on reconnect.
    async fn backfill(
        &self,
        market: &str,
        symbol: &str,
        n: usize,
    ) -> Result<Vec<RawRow>, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub poll_interval: Duration,
    pub poll_stale: Duration,
    pub poll_fetch_n: usize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub backfill_n: usize,
    pub backfill_on_reconnect: bool,
    pub poll_log_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            poll_stale: Duration::from_secs(10),
            poll_fetch_n: 100,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            backfill_n: 100,
            backfill_on_reconnect: true,
            poll_log_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PollStats {
    fetched: u64,
    accepted: u64,
    enqueued: u64,
    dropped_stale_baseline: u64,
    dropped_queue_full: u64,
    dropped_mapping_error: u64,
}

/// Shared driver state, handed to both the reconnect loop and the poll
/// loop, and implementing [`PushSink`] for the gateway's push callbacks.
pub struct Driver {
    gateway: Arc<dyn QuoteGateway>,
    queue: Arc<TickQueue>,
    seqstate: SeqTracker,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    symbols: Vec<(String, String)>,
    config: DriverConfig,
    last_push_monotonic_ms: Mutex<HashMap<(String, String), u64>>,
    poll_stats: Mutex<PollStats>,
    last_poll_log: Mutex<Instant>,
}

impl Driver {
    pub fn new(
        gateway: Arc<dyn QuoteGateway>,
        queue: Arc<TickQueue>,
        seqstate: SeqTracker,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
        symbols: Vec<(String, String)>,
        config: DriverConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            queue,
            seqstate,
            metrics,
            clock,
            symbols,
            config,
            last_push_monotonic_ms: Mutex::new(HashMap::new()),
            poll_stats: Mutex::new(PollStats::default()),
            last_poll_log: Mutex::new(Instant::now()),
        })
    }

    /// Reconnect loop with bounded exponential backoff. Runs until the
    /// returned future is dropped (i.e. the caller's task is cancelled on
    /// shutdown).
    pub async fn run_connect_loop(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_min;
        loop {
            let sink: Arc<dyn PushSink> = self.clone();
            match self.gateway.connect(sink).await {
                Ok(()) => {
                    backoff = self.config.reconnect_min;
                    if let Err(e) = self.gateway.subscribe(&self.symbols).await {
                        warn!(error = %e, "subscribe failed after connect");
                        tokio::time::sleep(backoff).await;
                        backoff = grow(backoff, self.config.reconnect_max);
                        continue;
                    }
                    if self.config.backfill_on_reconnect {
                        self.run_backfill().await;
                    }
                    let reason = self.gateway.wait_for_disconnect().await;
                    warn!(error = %reason, "upstream disconnected, will reconnect");
                }
                Err(e) => {
                    warn!(error = %e, "connect failed, backing off");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = grow(backoff, self.config.reconnect_max);
        }
    }

    async fn run_backfill(&self) {
        for (market, symbol) in &self.symbols {
            match self
                .gateway
                .backfill(market, symbol, self.config.backfill_n)
                .await
            {
                Ok(rows) => {
                    for row in rows {
                        self.process_raw_row(row, false);
                    }
                }
                Err(e) => {
                    warn!(market, symbol, error = %e, "backfill failed");
                }
            }
        }
    }

    /// Poll fallback loop: fires every `poll_interval`, skipping symbols
    /// that push has kept fresh within `poll_stale`.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            for (market, symbol) in self.symbols.clone() {
                if self.is_fresh_from_push(&market, &symbol) {
                    continue;
                }
                self.poll_one(&market, &symbol).await;
            }
            self.maybe_log_poll_stats();
        }
    }

    fn is_fresh_from_push(&self, market: &str, symbol: &str) -> bool {
        let last = self
            .last_push_monotonic_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(market.to_string(), symbol.to_string()))
            .copied();
        match last {
            None => false,
            Some(ms) => {
                let age = self.clock.monotonic_ms().saturating_sub(ms);
                age < self.config.poll_stale.as_millis() as u64
            }
        }
    }

    async fn poll_one(&self, market: &str, symbol: &str) {
        let result = self
            .gateway
            .poll_recent(market, symbol, self.config.poll_fetch_n)
            .await;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!(market, symbol, error = %e, "poll failed");
                return;
            }
        };

        let baseline = self.seqstate.baseline(market, symbol);
        let mut stats = self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.fetched += rows.len() as u64;

        for row in rows {
            if let Some(seq) = row.get("seq").and_then(|v| v.as_i64()) {
                if let Some(b) = baseline {
                    if seq <= b {
                        stats.dropped_stale_baseline += 1;
                        continue;
                    }
                }
            }
            drop(stats);
            self.process_raw_row(row, false);
            stats = self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
        }
    }

    fn maybe_log_poll_stats(&self) {
        let mut last_log = self
            .last_poll_log
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if last_log.elapsed() < self.config.poll_log_interval {
            return;
        }
        *last_log = Instant::now();
        let stats = *self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
        info!(
            fetched = stats.fetched,
            accepted = stats.accepted,
            enqueued = stats.enqueued,
            dropped_stale_baseline = stats.dropped_stale_baseline,
            dropped_queue_full = stats.dropped_queue_full,
            dropped_mapping_error = stats.dropped_mapping_error,
            "poll cycle stats"
        );
    }

    /// Common map → observe → accept → offer path shared by push and
    /// poll. `from_push` controls whether the symbol's push-freshness
    /// clock is updated.
    fn process_raw_row(&self, row: RawRow, from_push: bool) {
        let recv_ts_ms = self.clock.now_utc().timestamp_millis();
        let (tick, warnings) = match map_row(&row, recv_ts_ms) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "row mapping failed, dropping row");
                self.metrics.inc_drop(DropReason::MappingError);
                if !from_push {
                    let mut stats = self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
                    stats.dropped_mapping_error += 1;
                }
                return;
            }
        };
        for w in warnings {
            warn!(kind = ?w.kind, detail = %w.detail, "row mapping warning");
        }
        self.accept_and_offer(tick, from_push);
    }

    fn accept_and_offer(&self, tick: Tick, from_push: bool) {
        self.seqstate.observe(&tick.market, &tick.symbol, tick.seq);

        let accepted = self.seqstate.try_accept(&tick.market, &tick.symbol, tick.seq);
        if !accepted {
            return;
        }
        // A non-duplicate row just cleared dedupe, regardless of whether
        // the queue offer below succeeds — this is the signal the
        // watchdog's stall diagnosis treats as "upstream active", and it
        // must not require a successful enqueue (spec.md §4.7's
        // duplicate-only-windows rule is about dedupe, not queue health).
        self.metrics.record_accept(self.clock.monotonic_ms());

        let market = tick.market.clone();
        let symbol = tick.symbol.clone();
        let seq = tick.seq;

        match self.queue.offer(tick) {
            OfferResult::Accepted => {
                if !from_push {
                    let mut stats = self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
                    stats.accepted += 1;
                    stats.enqueued += 1;
                }
            }
            OfferResult::Full => {
                self.seqstate.rollback_accept(&market, &symbol, seq);
                self.metrics.inc_drop(DropReason::QueueFull);
                if !from_push {
                    let mut stats = self.poll_stats.lock().unwrap_or_else(|p| p.into_inner());
                    stats.accepted += 1;
                    stats.dropped_queue_full += 1;
                }
            }
        }

        if from_push {
            let now = self.clock.monotonic_ms();
            self.last_push_monotonic_ms
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert((market, symbol), now);
        }
    }
}

#[async_trait]
impl PushSink for Driver {
    async fn on_push_batch(&self, rows: Vec<RawRow>) {
        for row in rows {
            self.process_raw_row(row, true);
        }
    }
}

fn grow(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
