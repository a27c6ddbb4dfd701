//! Periodic stall diagnosis, recovery escalation, and the drift guard.
//!
//! The state machine shape (`ok → degraded → recovering →
//! {ok, persistent_stall}`) mirrors the teacher's `ArmState`'s
//! fail-closed, explicit-transition style: every move between states is
//! a named, pure function of the previous state plus one cycle's
//! snapshot, never a direct field assignment from outside this module.

use std::time::Duration;

use uuid::Uuid;

/// Tunables, one field per `WATCHDOG_*` name in the configuration
/// contract.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    pub stall: Duration,
    pub upstream_window: Duration,
    pub queue_threshold_rows: i64,
    pub recovery_max_failures: u32,
    pub recovery_join_timeout: Duration,
    pub drift_warn: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stall: Duration::from_secs(180),
            upstream_window: Duration::from_secs(60),
            queue_threshold_rows: 100,
            recovery_max_failures: 3,
            recovery_join_timeout: Duration::from_secs(3),
            drift_warn: Duration::from_secs(120),
        }
    }
}

/// One cycle's worth of sampled liveness signals, gathered by the caller
/// (the lifecycle coordinator) from `hkmd-queue`, `hkmd-worker`, and
/// `hkmd-gateway` and handed to [`Watchdog::tick`].
///
/// `upstream_active_within_window` must already exclude duplicate-only
/// activity — a window where upstream delivered rows but none were newly
/// accepted does not count as active, per the "duplicate-only upstream
/// windows must not diagnose a stall" rule. The caller derives this from
/// `hkmd-seqstate`'s accept counter, not from raw row counts.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub now_monotonic_ms: u64,
    pub queue_depth: i64,
    pub last_commit_monotonic_ms: Option<u64>,
    pub worker_alive: bool,
    pub upstream_active_within_window: bool,
    /// Wall-clock `ts_ms` maximum across recent commits, for the drift
    /// guard. `None` when nothing has committed yet.
    pub max_committed_ts_ms: Option<i64>,
    pub now_wall_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Ok,
    Degraded,
    Recovering,
    /// Terminal within this process; reaching this state is always
    /// paired with [`WatchdogAction::Exit`].
    PersistentStall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    /// First stall diagnosis for this episode: log a diagnostic snapshot
    /// to the tracing sink and request writer recovery.
    DiagnoseAndRecover,
    /// Stall signature persists after a prior recovery attempt: request
    /// recovery again.
    RetryRecover,
    /// `recovery_failures` reached the configured maximum: log the
    /// persistent-stall record under `event_id` and exit non-zero.
    Exit { event_id: Uuid },
}

/// Drift guard result: `Some(drift_ms)` when `|now - max_committed_ts|`
/// exceeds `drift_warn`. Never gates the stall state machine.
pub fn drift_warning(snapshot: &HealthSnapshot, cfg: &WatchdogConfig) -> Option<i64> {
    let max_ts = snapshot.max_committed_ts_ms?;
    let drift_ms = (snapshot.now_wall_ms - max_ts).abs();
    if drift_ms as u64 > cfg.drift_warn.as_millis() as u64 {
        Some(drift_ms)
    } else {
        None
    }
}

fn is_stalled(snapshot: &HealthSnapshot, cfg: &WatchdogConfig) -> bool {
    if !snapshot.upstream_active_within_window {
        return false;
    }
    if snapshot.queue_depth < cfg.queue_threshold_rows {
        return false;
    }
    let commit_age_ms = snapshot
        .last_commit_monotonic_ms
        .map(|c| snapshot.now_monotonic_ms.saturating_sub(c))
        .unwrap_or(u64::MAX);
    commit_age_ms >= cfg.stall.as_millis() as u64 || !snapshot.worker_alive
}

/// Stateful watchdog. One instance per process, ticked once per
/// `check_interval` by the lifecycle coordinator's health loop.
pub struct Watchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    recovery_failures: u32,
    /// `last_commit_monotonic_ms` as observed when the current recovery
    /// episode began, so a later tick can tell whether a commit has
    /// actually landed since (the `recovering -> ok` trigger) rather than
    /// just re-checking the same stall predicate.
    commit_baseline_ms: Option<u64>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            state: WatchdogState::Ok,
            recovery_failures: 0,
            commit_baseline_ms: None,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn recovery_failures(&self) -> u32 {
        self.recovery_failures
    }

    /// Advance the state machine by one health cycle.
    ///
    /// `ok -> degraded` fires on the cycle a stall is first diagnosed;
    /// the recovery request goes out on that same cycle (per the
    /// diagnose-then-recover contract), so `degraded` is the state the
    /// episode sits in while waiting to see whether that request landed
    /// a commit. The cycle after that, `degraded -> recovering` once a
    /// second recovery is actually issued, or `degraded -> ok` if a
    /// commit already cleared the stall.
    pub fn tick(&mut self, snapshot: &HealthSnapshot) -> WatchdogAction {
        match self.state {
            WatchdogState::Ok => {
                if is_stalled(snapshot, &self.config) {
                    self.state = WatchdogState::Degraded;
                    self.commit_baseline_ms = snapshot.last_commit_monotonic_ms;
                    WatchdogAction::DiagnoseAndRecover
                } else {
                    WatchdogAction::None
                }
            }
            WatchdogState::Degraded | WatchdogState::Recovering => {
                if self.committed_since_baseline(snapshot) {
                    self.state = WatchdogState::Ok;
                    self.recovery_failures = 0;
                    self.commit_baseline_ms = None;
                    return WatchdogAction::None;
                }
                if !is_stalled(snapshot, &self.config) {
                    // Stall predicate cleared without a confirmed commit;
                    // hold position rather than declaring recovery.
                    return WatchdogAction::None;
                }
                self.recovery_failures += 1;
                if self.recovery_failures >= self.config.recovery_max_failures {
                    self.state = WatchdogState::PersistentStall;
                    WatchdogAction::Exit {
                        event_id: Uuid::new_v4(),
                    }
                } else {
                    // A second (or later) recovery request has now gone
                    // out for this episode; no longer just "first-diagnosed".
                    self.state = WatchdogState::Recovering;
                    WatchdogAction::RetryRecover
                }
            }
            WatchdogState::PersistentStall => WatchdogAction::None,
        }
    }

    fn committed_since_baseline(&self, snapshot: &HealthSnapshot) -> bool {
        match (self.commit_baseline_ms, snapshot.last_commit_monotonic_ms) {
            (None, Some(_)) => true,
            (Some(baseline), Some(latest)) => latest > baseline,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> HealthSnapshot {
        HealthSnapshot {
            now_monotonic_ms: 1_000_000,
            queue_depth: 0,
            last_commit_monotonic_ms: Some(999_000),
            worker_alive: true,
            upstream_active_within_window: true,
            max_committed_ts_ms: Some(1_770_000_000_000),
            now_wall_ms: 1_770_000_000_000,
        }
    }

    #[test]
    fn healthy_snapshot_stays_ok() {
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let snap = base_snapshot();
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
        assert_eq!(wd.state(), WatchdogState::Ok);
    }

    #[test]
    fn low_queue_depth_never_diagnoses_a_stall() {
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let mut snap = base_snapshot();
        snap.queue_depth = 50;
        snap.last_commit_monotonic_ms = Some(0);
        snap.now_monotonic_ms = 1_000_000_000;
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
    }

    #[test]
    fn inactive_upstream_never_diagnoses_a_stall() {
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let mut snap = base_snapshot();
        snap.upstream_active_within_window = false;
        snap.queue_depth = 500;
        snap.last_commit_monotonic_ms = Some(0);
        snap.now_monotonic_ms = 1_000_000_000;
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
    }

    #[test]
    fn stall_then_recovery_then_commit_returns_to_ok() {
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let mut snap = base_snapshot();
        snap.queue_depth = 500;
        snap.last_commit_monotonic_ms = Some(0);
        snap.now_monotonic_ms = 1_000_000_000;

        assert_eq!(wd.tick(&snap), WatchdogAction::DiagnoseAndRecover);
        assert_eq!(wd.state(), WatchdogState::Degraded);

        // Still stalled next cycle, no commit landed yet.
        snap.now_monotonic_ms += 60_000;
        assert_eq!(wd.tick(&snap), WatchdogAction::RetryRecover);
        assert_eq!(wd.recovery_failures(), 1);
        assert_eq!(wd.state(), WatchdogState::Recovering);

        // A commit lands.
        snap.last_commit_monotonic_ms = Some(snap.now_monotonic_ms);
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
        assert_eq!(wd.state(), WatchdogState::Ok);
        assert_eq!(wd.recovery_failures(), 0);
    }

    #[test]
    fn commit_during_degraded_returns_to_ok_without_a_retry() {
        // A commit that lands before the episode ever reaches a second
        // recovery request should clear the stall straight from
        // `degraded`, without ever touching `recovering`.
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let mut snap = base_snapshot();
        snap.queue_depth = 500;
        snap.last_commit_monotonic_ms = Some(0);
        snap.now_monotonic_ms = 1_000_000_000;

        assert_eq!(wd.tick(&snap), WatchdogAction::DiagnoseAndRecover);
        assert_eq!(wd.state(), WatchdogState::Degraded);

        snap.now_monotonic_ms += 60_000;
        snap.last_commit_monotonic_ms = Some(snap.now_monotonic_ms);
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
        assert_eq!(wd.state(), WatchdogState::Ok);
        assert_eq!(wd.recovery_failures(), 0);
    }

    #[test]
    fn repeated_stall_escalates_to_exit_after_max_failures() {
        let cfg = WatchdogConfig {
            recovery_max_failures: 3,
            ..WatchdogConfig::default()
        };
        let mut wd = Watchdog::new(cfg);
        let mut snap = base_snapshot();
        snap.queue_depth = 500;
        snap.last_commit_monotonic_ms = Some(0);
        snap.now_monotonic_ms = 1_000_000_000;

        assert_eq!(wd.tick(&snap), WatchdogAction::DiagnoseAndRecover);
        snap.now_monotonic_ms += 60_000;
        assert_eq!(wd.tick(&snap), WatchdogAction::RetryRecover);
        snap.now_monotonic_ms += 60_000;
        assert_eq!(wd.tick(&snap), WatchdogAction::RetryRecover);
        snap.now_monotonic_ms += 60_000;
        match wd.tick(&snap) {
            WatchdogAction::Exit { .. } => {}
            other => panic!("expected Exit, got {other:?}"),
        }
        assert_eq!(wd.state(), WatchdogState::PersistentStall);
    }

    #[test]
    fn worker_not_alive_diagnoses_a_stall_regardless_of_commit_age() {
        let mut wd = Watchdog::new(WatchdogConfig::default());
        let mut snap = base_snapshot();
        snap.queue_depth = 500;
        snap.worker_alive = false;
        snap.last_commit_monotonic_ms = Some(snap.now_monotonic_ms);
        assert_eq!(wd.tick(&snap), WatchdogAction::DiagnoseAndRecover);
    }

    #[test]
    fn drift_guard_warns_without_affecting_stall_state() {
        let cfg = WatchdogConfig::default();
        let mut snap = base_snapshot();
        snap.max_committed_ts_ms = Some(0);
        snap.now_wall_ms = (cfg.drift_warn.as_millis() as i64) * 3;
        assert!(drift_warning(&snap, &cfg).is_some());

        let mut wd = Watchdog::new(cfg);
        assert_eq!(wd.tick(&snap), WatchdogAction::None);
    }

    #[test]
    fn drift_guard_silent_within_tolerance() {
        let cfg = WatchdogConfig::default();
        let mut snap = base_snapshot();
        snap.max_committed_ts_ms = Some(snap.now_wall_ms);
        assert!(drift_warning(&snap, &cfg).is_none());
    }
}
