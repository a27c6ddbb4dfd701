//! The persistence worker: a single dedicated thread that drains the
//! bounded queue, partitions by trading day, and commits through
//! `hkmd-store`'s writer with backoff-then-retry-forever on transient
//! failure.
//!
//! Grounded on the teacher's `mqk-testkit::recovery` single-shot
//! reconciliation loop (inspect → act → report) and the `other_examples/`
//! Kaspalytics daemon writer's interval-driven batch flush against a
//! channel receiver. The thread itself runs a single-threaded Tokio
//! runtime so it can call `hkmd-store`'s async `sqlx` calls without
//! promoting persistence to a pool of async tasks — there is exactly one
//! writer thread, matching spec.md's concurrency model.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use hkmd_clock::Clock;
use hkmd_metrics::{DropReason, Metrics};
use hkmd_model::Tick;
use hkmd_queue::TickQueue;
use hkmd_seqstate::SeqTracker;
use hkmd_store::{DayStoreWriter, Pragmas, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub data_root: PathBuf,
    pub pragmas: Pragmas,
    pub batch_size: usize,
    pub max_wait: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
    pub stop_flush_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            pragmas: Pragmas::default(),
            batch_size: 500,
            max_wait: Duration::from_secs(1),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            stop_flush_timeout: Duration::from_secs(10),
        }
    }
}

enum WorkerCommand {
    RecoverNow,
    Stop,
}

/// Handle to a running worker thread. `Clone`-able so both the watchdog
/// and the lifecycle coordinator can hold one.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    alive: Arc<AtomicBool>,
    recovery_count: Arc<AtomicU64>,
    last_recovery_monotonic_ms: Arc<AtomicU64>,
    last_commit_monotonic_ms: Arc<AtomicU64>,
    /// Running wall-clock `ts_ms` maximum across every row committed so
    /// far this process; `i64::MIN` until the first commit. Feeds the
    /// watchdog's drift guard.
    max_committed_ts_ms: Arc<AtomicI64>,
}

impl WorkerHandle {
    /// Ask the worker to close and rebuild its writer(s) at its next safe
    /// point. Non-blocking; the effect is observed on a later heartbeat
    /// or health snapshot.
    pub fn request_writer_recovery(&self) {
        let _ = self.commands.send(WorkerCommand::RecoverNow);
    }

    pub fn request_stop(&self) {
        let _ = self.commands.send(WorkerCommand::Stop);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn recovery_count(&self) -> u64 {
        self.recovery_count.load(Ordering::Relaxed)
    }

    pub fn last_recovery_monotonic_ms(&self) -> Option<u64> {
        match self.last_recovery_monotonic_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Monotonic instant of the most recent successful commit, for the
    /// watchdog's `commit_age` computation. `None` before the first
    /// commit of this process's lifetime.
    pub fn last_commit_monotonic_ms(&self) -> Option<u64> {
        match self.last_commit_monotonic_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Running wall-clock `ts_ms` maximum across every commit so far,
    /// for the watchdog's drift guard. `None` before the first commit.
    pub fn max_committed_ts_ms(&self) -> Option<i64> {
        match self.max_committed_ts_ms.load(Ordering::Relaxed) {
            i64::MIN => None,
            ts => Some(ts),
        }
    }
}

/// Outcome of a clean-vs-timed-out shutdown, for the lifecycle
/// coordinator's exit-code decision (spec.md §4.8 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    FlushedClean,
    TimedOut,
}

pub struct WorkerJoin {
    thread: JoinHandle<StopOutcome>,
}

impl WorkerJoin {
    pub fn join(self) -> StopOutcome {
        self.thread.join().unwrap_or(StopOutcome::TimedOut)
    }
}

struct LastException {
    class: String,
    at_monotonic_ms: u64,
}

/// Rolling commit-latency stats over the last 64 commits.
#[derive(Default)]
struct LatencyStats {
    samples: VecDeque<u64>,
}

impl LatencyStats {
    const CAPACITY: usize = 64;

    fn push(&mut self, ms: u64) {
        if self.samples.len() == Self::CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn mean_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }
}

/// Spawn the persistence worker on its own OS thread. Returns a
/// `(WorkerHandle, WorkerJoin)` pair: the handle for recovery/stop
/// signaling, the join value to retrieve the shutdown outcome.
pub fn spawn(
    queue: Arc<TickQueue>,
    seqstate: SeqTracker,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
) -> (WorkerHandle, WorkerJoin) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let alive = Arc::new(AtomicBool::new(true));
    let recovery_count = Arc::new(AtomicU64::new(0));
    let last_recovery_monotonic_ms = Arc::new(AtomicU64::new(0));
    let last_commit_monotonic_ms = Arc::new(AtomicU64::new(0));
    let max_committed_ts_ms = Arc::new(AtomicI64::new(i64::MIN));

    let handle = WorkerHandle {
        commands: tx,
        alive: alive.clone(),
        recovery_count: recovery_count.clone(),
        last_recovery_monotonic_ms: last_recovery_monotonic_ms.clone(),
        last_commit_monotonic_ms: last_commit_monotonic_ms.clone(),
        max_committed_ts_ms: max_committed_ts_ms.clone(),
    };

    let thread = std::thread::Builder::new()
        .name("hkmd-persistence-worker".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");
            let outcome = runtime.block_on(run_loop(
                queue,
                seqstate,
                metrics,
                clock,
                config,
                rx,
                recovery_count,
                last_recovery_monotonic_ms,
                last_commit_monotonic_ms,
                max_committed_ts_ms,
            ));
            alive.store(false, Ordering::Relaxed);
            outcome
        })
        .expect("failed to spawn persistence worker thread");

    (handle, WorkerJoin { thread })
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    queue: Arc<TickQueue>,
    seqstate: SeqTracker,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    commands: Receiver<WorkerCommand>,
    recovery_count: Arc<AtomicU64>,
    last_recovery_monotonic_ms: Arc<AtomicU64>,
    shared_last_commit_monotonic_ms: Arc<AtomicU64>,
    shared_max_committed_ts_ms: Arc<AtomicI64>,
) -> StopOutcome {
    let mut writers: HashMap<String, DayStoreWriter> = HashMap::new();
    let mut last_commit_monotonic_ms: Option<u64> = None;
    let mut last_heartbeat = Instant::now();
    let mut latency = LatencyStats::default();
    let mut last_exception: Option<LastException> = None;

    let mut stop_requested = false;
    let mut stop_deadline: Option<Instant> = None;

    loop {
        for cmd in commands.try_iter() {
            match cmd {
                WorkerCommand::RecoverNow => {
                    for (_, writer) in writers.drain() {
                        let _ = writer.close().await;
                    }
                    recovery_count.fetch_add(1, Ordering::Relaxed);
                    last_recovery_monotonic_ms.store(clock.monotonic_ms(), Ordering::Relaxed);
                    metrics.inc_recovery();
                    info!("persistence worker recovered: writers closed and will rebuild on next use");
                }
                WorkerCommand::Stop => {
                    stop_requested = true;
                    stop_deadline = Some(Instant::now() + config.stop_flush_timeout);
                }
            }
        }

        if stop_requested {
            if queue.depth() == 0 {
                for (_, writer) in writers.drain() {
                    let _ = writer.close().await;
                }
                return StopOutcome::FlushedClean;
            }
            if let Some(deadline) = stop_deadline {
                if Instant::now() >= deadline {
                    for (_, writer) in writers.drain() {
                        let _ = writer.close().await;
                    }
                    warn!("persistence worker stop_flush_timeout elapsed with rows still queued");
                    return StopOutcome::TimedOut;
                }
            }
        }

        let wait = if stop_requested {
            Duration::from_millis(200).min(config.max_wait)
        } else {
            config.max_wait
        };
        let batch = queue.drain_batch(config.batch_size, wait);
        metrics.set_queue_depth(queue.depth() as i64);

        if !batch.is_empty() {
            commit_batch(
                batch,
                &mut writers,
                &config,
                &clock,
                &seqstate,
                &metrics,
                &mut last_commit_monotonic_ms,
                &shared_last_commit_monotonic_ms,
                &shared_max_committed_ts_ms,
                &mut latency,
                &mut last_exception,
            )
            .await;
        }

        maybe_heartbeat(
            &mut last_heartbeat,
            &config,
            &queue,
            &writers,
            &metrics,
            last_commit_monotonic_ms,
            &last_exception,
            recovery_count.load(Ordering::Relaxed),
            &latency,
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn commit_batch(
    batch: Vec<Tick>,
    writers: &mut HashMap<String, DayStoreWriter>,
    config: &WorkerConfig,
    clock: &Arc<dyn Clock>,
    seqstate: &SeqTracker,
    metrics: &Metrics,
    last_commit_monotonic_ms: &mut Option<u64>,
    shared_last_commit_monotonic_ms: &Arc<AtomicU64>,
    shared_max_committed_ts_ms: &Arc<AtomicI64>,
    latency: &mut LatencyStats,
    last_exception: &mut Option<LastException>,
) {
    let mut by_day: HashMap<String, Vec<Tick>> = HashMap::new();
    for tick in batch {
        by_day.entry(tick.trading_day.clone()).or_default().push(tick);
    }

    for (day, rows) in by_day {
        let mut backoff = config.backoff_min;
        loop {
            let writer = match get_or_create_writer(writers, config, &day).await {
                Ok(w) => w,
                Err(e) => {
                    record_exception(last_exception, clock, &e);
                    error!(trading_day = %day, error = %e, "failed to open day writer; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2u32).min(config.backoff_max);
                    continue;
                }
            };

            let commit_started = Instant::now();
            match writer.insert_batch(&rows, clock.now_utc().timestamp_millis()).await {
                Ok(result) => {
                    metrics.record_commit(result.inserted, result.ignored);
                    debug_assert_eq!(result.total(), rows.len() as u64);
                    latency.push(commit_started.elapsed().as_millis() as u64);
                    let now_monotonic_ms = clock.monotonic_ms();
                    *last_commit_monotonic_ms = Some(now_monotonic_ms);
                    shared_last_commit_monotonic_ms.store(now_monotonic_ms, Ordering::Relaxed);
                    if let Some(max_ts) = rows.iter().map(|r| r.ts_ms).max() {
                        shared_max_committed_ts_ms.fetch_max(max_ts, Ordering::Relaxed);
                    }
                    mark_persisted_per_symbol(seqstate, &rows);
                    break;
                }
                Err(e) if e.is_transient() => {
                    record_exception(last_exception, clock, &e);
                    metrics.inc_busy_backoff();
                    warn!(trading_day = %day, error = %e, "transient store error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2u32).min(config.backoff_max);
                }
                Err(e) if e.is_permanent() => {
                    record_exception(last_exception, clock, &e);
                    error!(trading_day = %day, error = %e, "permanent store error, rebuilding writer");
                    if let Some(w) = writers.remove(&day) {
                        let _ = w.close().await;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2u32).min(config.backoff_max);
                }
                Err(e) => {
                    record_exception(last_exception, clock, &e);
                    error!(trading_day = %day, error = %e, "unclassified store error, rebuilding writer");
                    if let Some(w) = writers.remove(&day) {
                        let _ = w.close().await;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2u32).min(config.backoff_max);
                }
            }
        }
    }
}

async fn get_or_create_writer<'a>(
    writers: &'a mut HashMap<String, DayStoreWriter>,
    config: &WorkerConfig,
    day: &str,
) -> Result<&'a DayStoreWriter, StoreError> {
    if !writers.contains_key(day) {
        let writer = DayStoreWriter::open(&config.data_root, day, config.pragmas).await?;
        writer.ensure_schema().await?;
        writers.insert(day.to_string(), writer);
    }
    Ok(writers.get(day).expect("just inserted"))
}

fn mark_persisted_per_symbol(seqstate: &SeqTracker, rows: &[Tick]) {
    let mut max_seq_per_symbol: HashMap<(String, String), i64> = HashMap::new();
    for row in rows {
        if let Some(seq) = row.seq {
            let key = (row.market.clone(), row.symbol.clone());
            max_seq_per_symbol
                .entry(key)
                .and_modify(|m| *m = (*m).max(seq))
                .or_insert(seq);
        }
    }
    for ((market, symbol), seq) in max_seq_per_symbol {
        seqstate.mark_persisted(&market, &symbol, Some(seq));
    }
}

fn record_exception(slot: &mut Option<LastException>, clock: &Arc<dyn Clock>, err: &StoreError) {
    let class = match err {
        StoreError::Busy(_) => "busy",
        StoreError::DiskFull(_) => "disk_full",
        StoreError::ReadOnly(_) => "readonly",
        StoreError::Io(_) => "io_error",
        StoreError::Other(_) => "other",
    };
    *slot = Some(LastException {
        class: class.to_string(),
        at_monotonic_ms: clock.monotonic_ms(),
    });
}

#[allow(clippy::too_many_arguments)]
fn maybe_heartbeat(
    last_heartbeat: &mut Instant,
    config: &WorkerConfig,
    queue: &TickQueue,
    writers: &HashMap<String, DayStoreWriter>,
    metrics: &Metrics,
    last_commit_monotonic_ms: Option<u64>,
    last_exception: &Option<LastException>,
    recovery_count: u64,
    latency: &LatencyStats,
) {
    if last_heartbeat.elapsed() < config.heartbeat_interval {
        return;
    }
    *last_heartbeat = Instant::now();

    let wal_bytes: u64 = writers.values().map(|w| w.wal_size_estimate()).sum();
    let snapshot = metrics.snapshot();
    let last_exception_class = last_exception.as_ref().map(|e| e.class.as_str()).unwrap_or("none");

    info!(
        queue_depth = queue.depth(),
        committed_total = snapshot.commits_total,
        rows_persisted_total = snapshot.rows_persisted_total,
        wal_bytes,
        last_exception_class,
        last_commit_monotonic_ms = last_commit_monotonic_ms.unwrap_or(0),
        recovery_count,
        mean_commit_latency_ms = latency.mean_ms().unwrap_or(0),
        "persistence worker heartbeat"
    );
}

/// Used by `hkmd-health` to drop the drop counter for a queue-full push.
pub fn record_queue_full_drop(metrics: &Metrics) {
    metrics.inc_drop(DropReason::QueueFull);
}
