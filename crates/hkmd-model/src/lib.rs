//! Normalized tick record and the pure row-mapping boundary.
//!
//! Everything upstream-shaped (loosely typed, provider-specific field
//! names and value encodings) is confined to [`RawRow`]/[`RawValue`] and
//! [`mapper::map_row`]. Past this module the rest of the workspace only
//! ever sees [`Tick`].

pub mod mapper;

use std::collections::HashMap;

pub use mapper::{map_row, MapWarning, MapWarningKind, MappingError};

/// A normalized tick event, per the Data Model.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub market: String,
    pub symbol: String,
    /// Event time, UTC epoch ms.
    pub ts_ms: i64,
    /// Wall-clock receive time at the process, UTC epoch ms.
    pub recv_ts_ms: i64,
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub turnover: Option<f64>,
    pub direction: Option<String>,
    pub tick_type: Option<String>,
    pub push_type: Option<String>,
    pub provider: Option<String>,
    /// Monotone per-symbol identifier from upstream, if any.
    pub seq: Option<i64>,
    /// `YYYYMMDD`, always derived from `ts_ms` in `Asia/Hong_Kong`.
    pub trading_day: String,
    /// Set by the writer at commit time; absent on a freshly mapped tick.
    pub inserted_at_ms: Option<i64>,
}

/// A loosely typed upstream value. Gateway drivers hand back rows as bags
/// of named fields with provider-specific encodings (stringly typed
/// numbers, JSON numbers, etc.) — `RawValue` carries them without forcing
/// a premature parse, per the "duck-typed row access confined to one
/// boundary" design note.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl RawValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Best-effort integer coercion: `Int` directly, `Float` only when it
    /// has no fractional part, `Str` via plain integer parse.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            RawValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            RawValue::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Best-effort float coercion: `Float`/`Int` directly, `Str` via plain
    /// float parse.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Float(f) => Some(*f),
            RawValue::Int(i) => Some(*i as f64),
            RawValue::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Str(s)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Int(i)
    }
}

impl From<f64> for RawValue {
    fn from(f: f64) -> Self {
        RawValue::Float(f)
    }
}

/// A raw upstream row: a loose bag of named fields. Field names are
/// whatever the gateway driver populates (see `hkmd-gateway`) — this
/// crate only cares about the subset named in [`mapper::map_row`]'s
/// contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow(pub HashMap<String, RawValue>);

impl RawRow {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(mut self, field: &str, value: impl Into<RawValue>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.0.get(field)
    }
}
