//! Monotonic clock, wall clock, and `Asia/Hong_Kong` trading-day derivation.
//!
//! Pure/deterministic where possible (see [`trading_day_hk`] and
//! [`naive_hk_to_utc_ms`]); the only non-deterministic piece is
//! [`SystemClock`], which is the sole production implementation of [`Clock`].
//! Tests substitute a fake clock (see `hkmd-testsupport::TestClock`) so the
//! rest of the workspace never calls `Instant::now()`/`Utc::now()` directly.

use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Hong_Kong;

/// Liveness and timestamping clock, injected once at startup.
///
/// `monotonic_ms` backs every stall/liveness computation in `hkmd-health`
/// and `hkmd-worker`; `now_utc` backs `recv_ts_ms` stamping and log
/// timestamps only. Per spec.md §9 Open Questions, a backwards wall-clock
/// step is never compensated for — only `monotonic_ms` is relied on for
/// ordering.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Milliseconds elapsed since an arbitrary, process-local epoch.
    /// Only deltas between two calls are meaningful.
    fn monotonic_ms(&self) -> u64;
}

/// Production clock: wall clock via `chrono::Utc::now`, monotonic via
/// `std::time::Instant` anchored at construction time.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Derive the `YYYYMMDD` Hong Kong trading day for a UTC epoch-ms timestamp.
///
/// `trading_day` is always derived from `ts_ms`, never from host local
/// time (spec.md §3 invariant). Returns `None` only if `ts_ms` is outside
/// the representable range of `chrono`'s epoch arithmetic.
pub fn trading_day_hk(ts_ms: i64) -> Option<String> {
    let dt = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
    let hk = dt.with_timezone(&Hong_Kong);
    Some(format!("{:04}{:02}{:02}", hk.year(), hk.month(), hk.day()))
}

/// Interpret a naive (timezone-less) date + time as Hong Kong local time and
/// convert to a UTC epoch-ms timestamp.
///
/// Hong Kong has observed a single fixed UTC+8 offset with no daylight
/// saving since 1979, so this conversion is always unambiguous — unlike
/// `TimeZone::from_local_datetime` in DST-observing zones, the `LocalResult`
/// here never needs disambiguation in practice, but we still surface `None`
/// defensively rather than panicking if `chrono-tz`'s table ever disagrees.
pub fn naive_hk_to_utc_ms(date: NaiveDate, time: NaiveTime) -> Option<i64> {
    let naive = date.and_time(time);
    let hk = Hong_Kong.from_local_datetime(&naive).single()?;
    Some(hk.with_timezone(&Utc).timestamp_millis())
}

/// Parse a `YYYYMMDD` trading-day string into a `NaiveDate`.
pub fn parse_trading_day(trading_day: &str) -> Option<NaiveDate> {
    if trading_day.len() != 8 || !trading_day.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = trading_day[0..4].parse().ok()?;
    let month: u32 = trading_day[4..6].parse().ok()?;
    let day: u32 = trading_day[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
