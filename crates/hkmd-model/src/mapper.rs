//! Pure row-to-`Tick` mapping: no I/O, no locks, no clock reads beyond the
//! wall-clock timestamp the caller passes in.
//!
//! Time fields are tried in the order spec.md §4.1 lays out: (1) a compact
//! numeric `HHMMSS`/`YYYYMMDDHHMMSS` field combined with a `trading_day`
//! hint, (2) an ISO-like market-local string, (3) a numeric epoch value
//! (seconds or milliseconds, told apart by magnitude). Every path
//! converges on a single UTC epoch-ms value before the eight-hour-shift
//! correction and `trading_day` re-derivation run uniformly.

use chrono::{NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::{RawRow, Tick};

/// A structured per-row mapping failure. Carries enough to log the
/// offending field without reconstructing the row from a string message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MappingError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("field '{field}' is empty")]
    EmptyField { field: &'static str },

    #[error("field '{field}' has value {value:?} which could not be parsed as a time")]
    UnparseableTime { field: &'static str, value: String },

    #[error("trading_day hint {value:?} is not a valid YYYYMMDD date")]
    InvalidTradingDayHint { value: String },

    #[error("derived ts_ms {ts_ms} is outside the representable range")]
    TimestampOutOfRange { ts_ms: i64 },
}

/// A non-fatal correction applied while mapping a row. Recorded alongside
/// the produced `Tick` so the driver can log it without the mapper itself
/// taking a logging dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct MapWarning {
    pub kind: MapWarningKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapWarningKind {
    /// The raw value was ahead of wall clock by something consistent with
    /// the historical eight-hour timezone bug, and was corrected.
    EightHourShiftCorrected,
    /// A present `seq` field failed its non-negative-integer contract and
    /// was cleared to null rather than rejecting the row.
    SeqCleared,
}

/// Minimum lead (ahead of wall clock) before the eight-hour-shift
/// correction is considered, per spec.md §3: "more than two hours ahead".
const SHIFT_GUARD_THRESHOLD_MS: i64 = 2 * 60 * 60 * 1000;
/// The correction applied once the guard threshold is crossed.
const EIGHT_HOURS_MS: i64 = 8 * 60 * 60 * 1000;
/// Tolerance band around exactly eight hours ahead, since upstream values
/// jitter by a handful of seconds around the historical bug's signature.
const SHIFT_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// Map a raw upstream row into a normalized [`Tick`].
///
/// `recv_ts_ms` is the wall-clock receive time (also the reference point
/// for the eight-hour-shift guard); callers pass it in rather than this
/// function reading a clock, keeping the mapper pure and trivially
/// testable.
pub fn map_row(row: &RawRow, recv_ts_ms: i64) -> Result<(Tick, Vec<MapWarning>), MappingError> {
    let mut warnings = Vec::new();

    let market = required_nonempty_str(row, "market")?;
    let symbol = required_nonempty_str(row, "symbol")?;

    let raw_ts_ms = resolve_event_time_ms(row)?;

    let (ts_ms, shift_warning) = apply_eight_hour_shift_guard(raw_ts_ms, recv_ts_ms);
    if let Some(w) = shift_warning {
        warnings.push(w);
    }

    let trading_day = hkmd_clock::trading_day_hk(ts_ms)
        .ok_or(MappingError::TimestampOutOfRange { ts_ms })?;

    let (seq, seq_warning) = resolve_seq(row);
    if let Some(w) = seq_warning {
        warnings.push(w);
    }

    let tick = Tick {
        market,
        symbol,
        ts_ms,
        recv_ts_ms,
        price: row.get("price").and_then(|v| v.as_f64()),
        volume: row.get("volume").and_then(|v| v.as_f64()),
        turnover: row.get("turnover").and_then(|v| v.as_f64()),
        direction: optional_str(row, "direction"),
        tick_type: optional_str(row, "tick_type"),
        push_type: optional_str(row, "push_type"),
        provider: optional_str(row, "provider"),
        seq,
        trading_day,
        inserted_at_ms: None,
    };

    Ok((tick, warnings))
}

fn required_nonempty_str(row: &RawRow, field: &'static str) -> Result<String, MappingError> {
    let value = row.get(field).ok_or(MappingError::MissingField { field })?;
    let s = match value {
        crate::RawValue::Str(s) => s.trim(),
        crate::RawValue::Null => return Err(MappingError::EmptyField { field }),
        _ => return Err(MappingError::EmptyField { field }),
    };
    if s.is_empty() {
        return Err(MappingError::EmptyField { field });
    }
    Ok(s.to_string())
}

fn optional_str(row: &RawRow, field: &str) -> Option<String> {
    row.get(field).and_then(|v| match v {
        crate::RawValue::Str(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// `seq`, if present, must be a non-negative integer; otherwise it is
/// cleared to null with a warning rather than rejecting the row.
fn resolve_seq(row: &RawRow) -> (Option<i64>, Option<MapWarning>) {
    match row.get("seq") {
        None => (None, None),
        Some(crate::RawValue::Null) => (None, None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => (Some(n), None),
            _ => {
                let warning = MapWarning {
                    kind: MapWarningKind::SeqCleared,
                    detail: format!("seq value {:?} is not a non-negative integer", v),
                };
                (None, Some(warning))
            }
        },
    }
}

/// Try the three time-parsing paths in the order the contract specifies,
/// returning the first one that applies to the fields present on the row.
fn resolve_event_time_ms(row: &RawRow) -> Result<i64, MappingError> {
    if let Some(ms) = try_compact_numeric_with_trading_day(row)? {
        return Ok(ms);
    }
    if let Some(ms) = try_iso_like_market_local(row)? {
        return Ok(ms);
    }
    if let Some(ms) = try_numeric_epoch(row)? {
        return Ok(ms);
    }
    Err(MappingError::MissingField { field: "ts" })
}

/// Path 1: a compact numeric time field (`HHMMSS` or `YYYYMMDDHHMMSS`)
/// combined with a `trading_day` hint (`YYYYMMDD`). Only applies when the
/// `time` field looks like one of these two compact shapes.
fn try_compact_numeric_with_trading_day(row: &RawRow) -> Result<Option<i64>, MappingError> {
    let Some(time_value) = row.get("time") else {
        return Ok(None);
    };
    let digits = match time_value {
        crate::RawValue::Str(s) if s.bytes().all(|b| b.is_ascii_digit()) && !s.is_empty() => {
            s.clone()
        }
        crate::RawValue::Int(i) if *i >= 0 => i.to_string(),
        _ => return Ok(None),
    };

    match digits.len() {
        6 => {
            // HHMMSS, paired with a mandatory trading_day hint.
            let trading_day = row
                .get("trading_day")
                .and_then(|v| v.as_str())
                .ok_or(MappingError::MissingField {
                    field: "trading_day",
                })?;
            let date = hkmd_clock::parse_trading_day(trading_day).ok_or_else(|| {
                MappingError::InvalidTradingDayHint {
                    value: trading_day.to_string(),
                }
            })?;
            let time = parse_hhmmss(&digits).ok_or_else(|| MappingError::UnparseableTime {
                field: "time",
                value: digits.clone(),
            })?;
            let ms = hkmd_clock::naive_hk_to_utc_ms(date, time).ok_or_else(|| {
                MappingError::UnparseableTime {
                    field: "time",
                    value: digits.clone(),
                }
            })?;
            Ok(Some(ms))
        }
        14 => {
            // YYYYMMDDHHMMSS, self-contained.
            let date_part = &digits[0..8];
            let time_part = &digits[8..14];
            let date = hkmd_clock::parse_trading_day(date_part).ok_or_else(|| {
                MappingError::UnparseableTime {
                    field: "time",
                    value: digits.clone(),
                }
            })?;
            let time = parse_hhmmss(time_part).ok_or_else(|| MappingError::UnparseableTime {
                field: "time",
                value: digits.clone(),
            })?;
            let ms = hkmd_clock::naive_hk_to_utc_ms(date, time).ok_or_else(|| {
                MappingError::UnparseableTime {
                    field: "time",
                    value: digits.clone(),
                }
            })?;
            Ok(Some(ms))
        }
        _ => Ok(None),
    }
}

fn parse_hhmmss(digits: &str) -> Option<NaiveTime> {
    if digits.len() != 6 {
        return None;
    }
    let hour: u32 = digits[0..2].parse().ok()?;
    let min: u32 = digits[2..4].parse().ok()?;
    let sec: u32 = digits[4..6].parse().ok()?;
    NaiveTime::from_hms_opt(hour, min, sec)
}

/// Path 2: an ISO-like market-local string, e.g. `"2026-02-12 09:30:15"`
/// or `"2026-02-12T09:30:15"`, interpreted as `Asia/Hong_Kong` local time.
fn try_iso_like_market_local(row: &RawRow) -> Result<Option<i64>, MappingError> {
    let Some(time_value) = row.get("time") else {
        return Ok(None);
    };
    let crate::RawValue::Str(s) = time_value else {
        return Ok(None);
    };
    let s = s.trim();
    if s.is_empty() || s.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }

    let normalized = s.replacen('T', " ", 1);
    let parsed = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f"));

    match parsed {
        Ok(naive) => {
            let ms = hkmd_clock::naive_hk_to_utc_ms(naive.date(), naive.time()).ok_or_else(|| {
                MappingError::UnparseableTime {
                    field: "time",
                    value: s.to_string(),
                }
            })?;
            Ok(Some(ms))
        }
        Err(_) => {
            // Also accept a bare market-local "HH:MM:SS" string combined
            // with a trading_day hint, as spec.md's scenario 6 uses.
            if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S") {
                let trading_day = row
                    .get("trading_day")
                    .and_then(|v| v.as_str())
                    .ok_or(MappingError::MissingField {
                        field: "trading_day",
                    })?;
                let date = hkmd_clock::parse_trading_day(trading_day).ok_or_else(|| {
                    MappingError::InvalidTradingDayHint {
                        value: trading_day.to_string(),
                    }
                })?;
                let ms = hkmd_clock::naive_hk_to_utc_ms(date, time).ok_or_else(|| {
                    MappingError::UnparseableTime {
                        field: "time",
                        value: s.to_string(),
                    }
                })?;
                return Ok(Some(ms));
            }
            Err(MappingError::UnparseableTime {
                field: "time",
                value: s.to_string(),
            })
        }
    }
}

/// Path 3: a numeric epoch value, in either seconds or milliseconds. Told
/// apart by magnitude: anything that would be before ~2001 if read as
/// milliseconds is assumed to be seconds instead.
const EPOCH_MS_LOWER_BOUND: i64 = 1_000_000_000_000; // 2001-09-09 in ms

fn try_numeric_epoch(row: &RawRow) -> Result<Option<i64>, MappingError> {
    let Some(value) = row.get("ts").or_else(|| row.get("time")) else {
        return Ok(None);
    };
    let Some(n) = value.as_i64() else {
        return Ok(None);
    };
    if n >= EPOCH_MS_LOWER_BOUND {
        Ok(Some(n))
    } else {
        Ok(Some(n.saturating_mul(1000)))
    }
}

/// If the event time sits more than two hours ahead of wall clock and is
/// within tolerance of exactly eight hours ahead, subtract eight hours and
/// return a warning. Otherwise pass the value through unchanged.
fn apply_eight_hour_shift_guard(ts_ms: i64, recv_ts_ms: i64) -> (i64, Option<MapWarning>) {
    let lead = ts_ms - recv_ts_ms;
    if lead <= SHIFT_GUARD_THRESHOLD_MS {
        return (ts_ms, None);
    }
    if (lead - EIGHT_HOURS_MS).abs() <= SHIFT_TOLERANCE_MS {
        let corrected = ts_ms - EIGHT_HOURS_MS;
        let warning = MapWarning {
            kind: MapWarningKind::EightHourShiftCorrected,
            detail: format!(
                "ts_ms {} was {}ms ahead of recv_ts_ms {}; corrected by -8h to {}",
                ts_ms, lead, recv_ts_ms, corrected
            ),
        };
        return (corrected, Some(warning));
    }
    (ts_ms, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawRow;
    use chrono::NaiveDate;

    fn base_row() -> RawRow {
        RawRow::new()
            .set("market", "HK")
            .set("symbol", "HK.00700")
    }

    #[test]
    fn compact_hhmmss_with_trading_day_is_hk_local() {
        let row = base_row()
            .set("trading_day", "20260212")
            .set("time", "093015");
        let (tick, warnings) = map_row(&row, 0).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(tick.trading_day, "20260212");
        let expected = hkmd_clock::naive_hk_to_utc_ms(
            NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 15).unwrap(),
        )
        .unwrap();
        assert_eq!(tick.ts_ms, expected);
    }

    #[test]
    fn compact_yyyymmddhhmmss_is_self_contained() {
        let row = base_row().set("time", "20260212093015");
        let (tick, _) = map_row(&row, 0).unwrap();
        assert_eq!(tick.trading_day, "20260212");
    }

    #[test]
    fn iso_like_market_local_string() {
        let row = base_row().set("time", "2026-02-12 09:30:15");
        let (tick, _) = map_row(&row, 0).unwrap();
        let expected = hkmd_clock::naive_hk_to_utc_ms(
            NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 15).unwrap(),
        )
        .unwrap();
        assert_eq!(tick.ts_ms, expected);
    }

    #[test]
    fn numeric_epoch_seconds_vs_millis_by_magnitude() {
        let seconds_row = base_row().set("ts", 1_770_000_000i64);
        let (t1, _) = map_row(&seconds_row, 1_770_000_000_000).unwrap();
        assert_eq!(t1.ts_ms, 1_770_000_000_000);

        let millis_row = base_row().set("ts", 1_770_000_000_000i64);
        let (t2, _) = map_row(&millis_row, 1_770_000_000_000).unwrap();
        assert_eq!(t2.ts_ms, 1_770_000_000_000);
    }

    #[test]
    fn timezone_correctness_matches_hk_local_regardless_of_host_locale() {
        // Scenario 6: market-local "09:30:15" on trading day 20260212,
        // independent of the host's own configured time zone.
        let row = base_row()
            .set("trading_day", "20260212")
            .set("time", "09:30:15");
        let (tick, _) = map_row(&row, 0).unwrap();
        let expected = hkmd_clock::naive_hk_to_utc_ms(
            NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 15).unwrap(),
        )
        .unwrap();
        assert_eq!(tick.ts_ms, expected);
        assert_eq!(tick.trading_day, "20260212");
    }

    #[test]
    fn eight_hour_future_value_is_corrected_with_warning() {
        let recv = 1_770_000_000_000i64;
        let shifted = recv + 8 * 60 * 60 * 1000;
        let row = base_row().set("ts", shifted);
        let (tick, warnings) = map_row(&row, recv).unwrap();
        assert_eq!(tick.ts_ms, recv);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, MapWarningKind::EightHourShiftCorrected);
    }

    #[test]
    fn two_hour_future_value_without_eight_hour_signature_is_untouched() {
        let recv = 1_770_000_000_000i64;
        let lead = 3 * 60 * 60 * 1000; // 3h ahead, not 8h
        let row = base_row().set("ts", recv + lead);
        let (tick, warnings) = map_row(&row, recv).unwrap();
        assert_eq!(tick.ts_ms, recv + lead);
        assert!(warnings.is_empty());
    }

    #[test]
    fn seq_present_and_non_negative_is_kept() {
        let row = base_row().set("ts", 1_770_000_000_000i64).set("seq", 42i64);
        let (tick, warnings) = map_row(&row, 1_770_000_000_000).unwrap();
        assert_eq!(tick.seq, Some(42));
        assert!(warnings.is_empty());
    }

    #[test]
    fn seq_negative_is_cleared_with_warning() {
        let row = base_row()
            .set("ts", 1_770_000_000_000i64)
            .set("seq", -1i64);
        let (tick, warnings) = map_row(&row, 1_770_000_000_000).unwrap();
        assert_eq!(tick.seq, None);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, MapWarningKind::SeqCleared);
    }

    #[test]
    fn seq_absent_is_null_without_warning() {
        let row = base_row().set("ts", 1_770_000_000_000i64);
        let (tick, warnings) = map_row(&row, 1_770_000_000_000).unwrap();
        assert_eq!(tick.seq, None);
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_symbol_is_rejected() {
        let row = RawRow::new()
            .set("market", "HK")
            .set("ts", 1_770_000_000_000i64);
        let err = map_row(&row, 1_770_000_000_000).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingField { field: "symbol" }
        );
    }

    #[test]
    fn empty_market_is_rejected() {
        let row = base_row().set("market", "").set("ts", 1_770_000_000_000i64);
        let err = map_row(&row, 1_770_000_000_000).unwrap_err();
        assert_eq!(err, MappingError::EmptyField { field: "market" });
    }

    #[test]
    fn no_usable_time_field_is_rejected() {
        let row = base_row();
        let err = map_row(&row, 0).unwrap_err();
        assert_eq!(err, MappingError::MissingField { field: "ts" });
    }

    #[test]
    fn price_volume_turnover_pass_through_as_optional_floats() {
        let row = base_row()
            .set("ts", 1_770_000_000_000i64)
            .set("price", 123.45f64)
            .set("volume", 100.0f64)
            .set("turnover", 12345.0f64);
        let (tick, _) = map_row(&row, 1_770_000_000_000).unwrap();
        assert_eq!(tick.price, Some(123.45));
        assert_eq!(tick.volume, Some(100.0));
        assert_eq!(tick.turnover, Some(12345.0));
    }
}
