//! Process bootstrap and graceful shutdown, per spec.md §4.8's seven-step
//! startup and six-step stop sequence.
//!
//! Grounded on `mqk-daemon/src/main.rs`'s thin-`main`, dev-`.env.local`
//! convention, generalized from "build an Axum router and serve it" to
//! "start three long-lived workers and wait for a stop signal," since
//! this daemon has no HTTP surface (see `DESIGN.md`).

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use uuid::Uuid;

use hkmd_clock::Clock;
use hkmd_config::{Config, MARKET};
use hkmd_gateway::{Driver, DriverConfig, QuoteGateway};
use hkmd_health::{drift_warning, HealthSnapshot, Watchdog, WatchdogAction, WatchdogConfig};
use hkmd_metrics::Metrics;
use hkmd_queue::TickQueue;
use hkmd_seqstate::SeqTracker;
use hkmd_store::Pragmas;
use hkmd_worker::{StopOutcome, WorkerConfig, WorkerHandle};

/// Tunables that spec.md §6 does not assign a configuration variable to.
/// `watchdog_check_interval` has no `WATCHDOG_*` entry in the contract
/// table — spec.md only names the thresholds the watchdog evaluates, not
/// how often it wakes up to evaluate them — so it is a constructor
/// parameter rather than an environment variable, defaulting to the same
/// cadence as `hkmd_health::WatchdogConfig::default()`. Tests shrink it to
/// avoid sleeping through a `std::thread::sleep`-paced real-time loop.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    pub watchdog_check_interval: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            watchdog_check_interval: Duration::from_secs(60),
        }
    }
}

/// Load configuration, seed state, start every long-lived component, and
/// block until `external_shutdown` resolves or an OS termination signal
/// arrives. Returns the process exit code (spec.md §4.8 stop step 6).
pub async fn run(
    config: Config,
    gateway: Arc<dyn QuoteGateway>,
    clock: Arc<dyn Clock>,
    external_shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<i32> {
    run_with_options(
        config,
        gateway,
        clock,
        external_shutdown,
        LifecycleOptions::default(),
    )
    .await
}

pub async fn run_with_options(
    config: Config,
    gateway: Arc<dyn QuoteGateway>,
    clock: Arc<dyn Clock>,
    external_shutdown: impl Future<Output = ()> + Send + 'static,
    options: LifecycleOptions,
) -> anyhow::Result<i32> {
    let (config_json, config_hash) = config.fingerprint();
    info!(config_hash, config = %config_json, "hkmd-daemon starting");

    // Step 2: resolve the data root. Only the directory is created; the
    // current trading day's file is left to the worker's first commit.
    let data_root = PathBuf::from(&config.data_root);
    std::fs::create_dir_all(&data_root).context("failed to create data root directory")?;

    let metrics = Metrics::new();
    let seqstate = SeqTracker::new();
    let queue = Arc::new(TickQueue::new(config.max_queue_size));

    // Step 3: seed sequence state from the last N day files.
    let seeds = hkmd_store::scan_recent_max_seq(&data_root, config.seed_recent_db_days)
        .await
        .context("failed to scan recent day files for sequence seeding")?;
    for (symbol, max_seq) in &seeds {
        seqstate.seed(MARKET, symbol, *max_seq);
    }
    info!(seeded_symbols = seeds.len(), "sequence state seeded from recent day files");

    // Step 4: start the persistence worker.
    let worker_config = WorkerConfig {
        data_root: data_root.clone(),
        pragmas: Pragmas {
            busy_timeout_ms: config.sqlite_busy_timeout_ms as u32,
            wal_autocheckpoint_pages: config.sqlite_wal_autocheckpoint,
        },
        batch_size: config.batch_size,
        max_wait: config.max_wait(),
        backoff_min: config.persist_retry_backoff(),
        backoff_max: config.persist_retry_backoff_max(),
        heartbeat_interval: Duration::from_secs(config.persist_heartbeat_interval_sec),
        stop_flush_timeout: Duration::from_secs(config.stop_flush_timeout_sec),
    };
    let (worker_handle, worker_join) = hkmd_worker::spawn(
        queue.clone(),
        seqstate.clone(),
        metrics.clone(),
        clock.clone(),
        worker_config,
    );

    // Step 5: start the upstream driver (connect + subscribe happen
    // inside its reconnect loop).
    let driver_config = DriverConfig {
        poll_interval: Duration::from_secs(config.poll_interval_sec),
        poll_stale: Duration::from_secs(config.poll_stale_sec),
        poll_fetch_n: config.poll_num,
        reconnect_min: config.reconnect_min_delay(),
        reconnect_max: config.reconnect_max_delay(),
        backfill_n: config.backfill_n,
        backfill_on_reconnect: config.backfill_n > 0,
        poll_log_interval: Duration::from_secs(60),
    };
    let driver = Driver::new(
        gateway,
        queue.clone(),
        seqstate.clone(),
        metrics.clone(),
        clock.clone(),
        config.symbol_universe(),
        driver_config,
    );
    let (driver_stop_tx, driver_stop_rx) = tokio::sync::oneshot::channel();
    let driver_thread = spawn_driver_thread(driver, config.poll_enabled, driver_stop_rx);

    // Step 6: start the health loop.
    let watchdog_config = WatchdogConfig {
        check_interval: options.watchdog_check_interval,
        stall: Duration::from_secs(config.watchdog_stall_sec),
        upstream_window: Duration::from_secs(config.watchdog_upstream_window_sec),
        queue_threshold_rows: config.watchdog_queue_threshold_rows,
        recovery_max_failures: config.watchdog_recovery_max_failures,
        recovery_join_timeout: Duration::from_secs(config.watchdog_recovery_join_timeout_sec),
        drift_warn: Duration::from_secs(config.drift_warn_sec),
    };
    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = std::sync::mpsc::channel::<WatchdogExitEvent>();
    let watchdog_thread = spawn_watchdog_thread(
        watchdog_config,
        queue.clone(),
        worker_handle.clone(),
        metrics.clone(),
        clock.clone(),
        watchdog_stop.clone(),
        exit_tx,
    );

    // Step 7: install signal handlers and wait.
    let shutdown_reason = wait_for_shutdown(external_shutdown, exit_rx).await?;
    match &shutdown_reason {
        ShutdownReason::External => info!("shutdown requested, starting graceful drain"),
        ShutdownReason::WatchdogExit { event_id } => {
            error!(event_id = %event_id, "watchdog declared a persistent stall, starting graceful drain")
        }
    }

    // Stop steps 1-3: stop accepting new pushes, stop the poll loop,
    // close upstream. The driver thread owns all three: dropping its
    // tokio runtime aborts the connect loop (pushes/subscription) and the
    // poll loop together.
    watchdog_stop.store(true, Ordering::Relaxed);
    let _ = driver_stop_tx.send(());
    if driver_thread.join().is_err() {
        warn!("gateway driver thread panicked during shutdown");
    }

    // Stop step 4-5: signal the worker to flush within its budget, which
    // closes every open day-store writer itself before returning.
    worker_handle.request_stop();
    let stop_outcome = tokio::task::spawn_blocking(move || worker_join.join())
        .await
        .unwrap_or(StopOutcome::TimedOut);

    if watchdog_thread.join().is_err() {
        warn!("watchdog thread panicked during shutdown");
    }

    // Stop step 6: exit code.
    let exit_code = match (&shutdown_reason, stop_outcome) {
        (ShutdownReason::WatchdogExit { .. }, _) => 1,
        (_, StopOutcome::TimedOut) => {
            warn!("graceful drain timed out with rows still queued");
            1
        }
        _ => 0,
    };
    info!(exit_code, "hkmd-daemon stopped");
    Ok(exit_code)
}

enum ShutdownReason {
    External,
    WatchdogExit { event_id: Uuid },
}

struct WatchdogExitEvent {
    event_id: Uuid,
}

async fn wait_for_shutdown(
    external_shutdown: impl Future<Output = ()> + Send + 'static,
    exit_rx: std::sync::mpsc::Receiver<WatchdogExitEvent>,
) -> anyhow::Result<ShutdownReason> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => Ok(ShutdownReason::External),
        _ = sigint.recv() => Ok(ShutdownReason::External),
        _ = external_shutdown => Ok(ShutdownReason::External),
        event = wait_for_watchdog_exit(exit_rx) => Ok(ShutdownReason::WatchdogExit { event_id: event }),
    }
}

async fn wait_for_watchdog_exit(exit_rx: std::sync::mpsc::Receiver<WatchdogExitEvent>) -> Uuid {
    let event = tokio::task::spawn_blocking(move || exit_rx.recv().ok()).await.ok().flatten();
    match event {
        Some(e) => e.event_id,
        // The watchdog thread dropped its sender without ever declaring a
        // persistent stall (e.g. it exited during shutdown); there is
        // nothing more to signal from this branch, so it never resolves
        // and the other `select!` arms decide the shutdown reason.
        None => std::future::pending().await,
    }
}

fn spawn_driver_thread(
    driver: Arc<Driver>,
    poll_enabled: bool,
    stop_rx: tokio::sync::oneshot::Receiver<()>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("hkmd-gateway-driver".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build gateway driver runtime");
            runtime.block_on(async move {
                let connect_task = tokio::spawn(driver.clone().run_connect_loop());
                let poll_task = poll_enabled.then(|| tokio::spawn(driver.run_poll_loop()));

                let _ = stop_rx.await;
                connect_task.abort();
                if let Some(task) = poll_task {
                    task.abort();
                }
            });
        })
        .expect("failed to spawn gateway driver thread")
}

#[allow(clippy::too_many_arguments)]
fn spawn_watchdog_thread(
    config: WatchdogConfig,
    queue: Arc<TickQueue>,
    worker: WorkerHandle,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    exit_tx: std::sync::mpsc::Sender<WatchdogExitEvent>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("hkmd-watchdog".into())
        .spawn(move || {
            let mut watchdog = Watchdog::new(config);
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(config.check_interval);
                if stop.load(Ordering::Relaxed) {
                    return;
                }

                let now_monotonic_ms = clock.monotonic_ms();
                let snapshot = HealthSnapshot {
                    now_monotonic_ms,
                    queue_depth: queue.depth() as i64,
                    last_commit_monotonic_ms: worker.last_commit_monotonic_ms(),
                    worker_alive: worker.is_alive(),
                    upstream_active_within_window: metrics
                        .last_accept_age_ms(now_monotonic_ms)
                        .map(|age_ms| age_ms <= config.upstream_window.as_millis() as u64)
                        .unwrap_or(false),
                    max_committed_ts_ms: worker.max_committed_ts_ms(),
                    now_wall_ms: clock.now_utc().timestamp_millis(),
                };

                if let Some(drift_ms) = drift_warning(&snapshot, &config) {
                    warn!(drift_ms, "commit timestamps have drifted from wall clock");
                }

                match watchdog.tick(&snapshot) {
                    WatchdogAction::None => {}
                    WatchdogAction::DiagnoseAndRecover => {
                        // Structured diagnostic snapshot to the tracing sink: this
                        // process does not capture OS thread stacks (nothing in the
                        // writer-worker path exposes that), so the liveness fields
                        // the watchdog itself already samples are the dump.
                        error!(
                            queue_depth = snapshot.queue_depth,
                            last_commit_monotonic_ms = snapshot.last_commit_monotonic_ms,
                            commit_age_ms = snapshot
                                .last_commit_monotonic_ms
                                .map(|c| snapshot.now_monotonic_ms.saturating_sub(c)),
                            worker_alive = snapshot.worker_alive,
                            "persistence stall diagnosed, requesting writer recovery"
                        );
                        worker.request_writer_recovery();
                    }
                    WatchdogAction::RetryRecover => {
                        warn!(
                            recovery_failures = watchdog.recovery_failures(),
                            queue_depth = snapshot.queue_depth,
                            "stall persists after recovery, requesting another writer recovery"
                        );
                        worker.request_writer_recovery();
                    }
                    WatchdogAction::Exit { event_id } => {
                        error!(
                            event_id = %event_id,
                            recovery_failures = watchdog.recovery_failures(),
                            "persistent stall: exceeded recovery attempts, requesting process exit"
                        );
                        let _ = exit_tx.send(WatchdogExitEvent { event_id });
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn watchdog thread")
}
