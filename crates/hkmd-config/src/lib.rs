//! Environment-driven configuration, per the `EXTERNAL INTERFACES`
//! variable table: one struct, one `from_env()` constructor, every name
//! and default documented at its call site rather than scattered
//! `std::env::var` calls.
//!
//! Generalized from the teacher's `mqk-config::load_layered_yaml` →
//! `canonicalize_json` → sha256 pattern: this workspace has no layered
//! YAML to merge (there is no YAML at all — see the dropped-dependency
//! note in `DESIGN.md`), so `from_env()` replaces the merge step, but the
//! canonicalize-then-hash step is kept verbatim for the same purpose —
//! an observability-only fingerprint operators can compare across
//! deployments without diffing every individual variable.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The Hong Kong equities market this collector serves; the system
/// models one gateway connection and one market per spec.md §1.
pub const MARKET: &str = "HK";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    Missing(&'static str),
    #[error("environment variable '{name}' has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub futu_host: String,
    pub futu_port: u16,
    pub futu_symbols: Vec<String>,

    pub data_root: String,

    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub max_queue_size: usize,
    pub backfill_n: usize,

    pub reconnect_min_delay_sec: u64,
    pub reconnect_max_delay_sec: u64,

    pub poll_enabled: bool,
    pub poll_interval_sec: u64,
    pub poll_num: usize,
    pub poll_stale_sec: u64,

    pub watchdog_stall_sec: u64,
    pub watchdog_upstream_window_sec: u64,
    pub watchdog_queue_threshold_rows: i64,
    pub watchdog_recovery_max_failures: u32,
    pub watchdog_recovery_join_timeout_sec: u64,

    pub stop_flush_timeout_sec: u64,
    pub seed_recent_db_days: usize,

    pub persist_retry_backoff_sec: f64,
    pub persist_retry_backoff_max_sec: f64,
    pub persist_heartbeat_interval_sec: u64,

    pub drift_warn_sec: u64,

    pub sqlite_busy_timeout_ms: u64,
    pub sqlite_journal_mode: String,
    pub sqlite_synchronous: String,
    pub sqlite_wal_autocheckpoint: u32,
}

impl Config {
    /// Read every contract variable from the process environment,
    /// applying the documented default when absent. `FUTU_SYMBOLS` is
    /// the one variable with no usable default — an empty or unset
    /// value is a startup failure, per spec.md §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        let futu_symbols = parse_symbol_list(&env_string("FUTU_SYMBOLS", ""))?;
        if futu_symbols.is_empty() {
            return Err(ConfigError::Missing("FUTU_SYMBOLS"));
        }

        Ok(Self {
            futu_host: env_string("FUTU_HOST", "127.0.0.1"),
            futu_port: env_parse("FUTU_PORT", 11111)?,
            futu_symbols,

            data_root: env_string("DATA_ROOT", "/data/sqlite/HK"),

            batch_size: env_parse("BATCH_SIZE", 500)?,
            max_wait_ms: env_parse("MAX_WAIT_MS", 1000)?,
            max_queue_size: env_parse("MAX_QUEUE_SIZE", 20_000)?,
            backfill_n: env_parse("BACKFILL_N", 0)?,

            reconnect_min_delay_sec: env_parse("RECONNECT_MIN_DELAY", 1)?,
            reconnect_max_delay_sec: env_parse("RECONNECT_MAX_DELAY", 60)?,

            poll_enabled: env_bool("FUTU_POLL_ENABLED", true)?,
            poll_interval_sec: env_parse("FUTU_POLL_INTERVAL_SEC", 3)?,
            poll_num: env_parse("FUTU_POLL_NUM", 100)?,
            poll_stale_sec: env_parse("FUTU_POLL_STALE_SEC", 10)?,

            watchdog_stall_sec: env_parse("WATCHDOG_STALL_SEC", 180)?,
            watchdog_upstream_window_sec: env_parse("WATCHDOG_UPSTREAM_WINDOW_SEC", 60)?,
            watchdog_queue_threshold_rows: env_parse("WATCHDOG_QUEUE_THRESHOLD_ROWS", 100)?,
            watchdog_recovery_max_failures: env_parse("WATCHDOG_RECOVERY_MAX_FAILURES", 3)?,
            watchdog_recovery_join_timeout_sec: env_parse(
                "WATCHDOG_RECOVERY_JOIN_TIMEOUT_SEC",
                3,
            )?,

            stop_flush_timeout_sec: env_parse("STOP_FLUSH_TIMEOUT_SEC", 60)?,
            seed_recent_db_days: env_parse("SEED_RECENT_DB_DAYS", 3)?,

            persist_retry_backoff_sec: env_parse("PERSIST_RETRY_BACKOFF_SEC", 1.0)?,
            persist_retry_backoff_max_sec: env_parse("PERSIST_RETRY_BACKOFF_MAX_SEC", 2.0)?,
            persist_heartbeat_interval_sec: env_parse("PERSIST_HEARTBEAT_INTERVAL_SEC", 30)?,

            drift_warn_sec: env_parse("DRIFT_WARN_SEC", 120)?,

            sqlite_busy_timeout_ms: env_parse("SQLITE_BUSY_TIMEOUT_MS", 5000)?,
            sqlite_journal_mode: env_string("SQLITE_JOURNAL_MODE", "WAL"),
            sqlite_synchronous: env_string("SQLITE_SYNCHRONOUS", "NORMAL"),
            sqlite_wal_autocheckpoint: env_parse("SQLITE_WAL_AUTOCHECKPOINT", 1000)?,
        })
    }

    /// `(market, symbol)` pairs for the configured universe, market fixed
    /// to [`MARKET`] (this collector serves exactly one market).
    pub fn symbol_universe(&self) -> Vec<(String, String)> {
        self.futu_symbols
            .iter()
            .map(|s| (MARKET.to_string(), s.clone()))
            .collect()
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_delay_sec)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_sec)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn persist_retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.persist_retry_backoff_sec)
    }

    pub fn persist_retry_backoff_max(&self) -> Duration {
        Duration::from_secs_f64(self.persist_retry_backoff_max_sec)
    }

    /// Canonical JSON (object keys sorted recursively) and its SHA-256
    /// hex digest, logged once at startup for observability — not
    /// consumed by any other component, and never used to gate behavior.
    pub fn fingerprint(&self) -> (String, String) {
        let value = serde_json::to_value(self).expect("Config serialization is infallible");
        let canonical = canonicalize_json(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        (canonical, hex::encode(hasher.finalize()))
    }
}

fn parse_symbol_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn env_string(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            reason: "could not be parsed".to_string(),
        }),
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so the resulting hash is order-independent.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that
    // touch them so they don't race each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_known_vars() {
        for name in [
            "FUTU_HOST",
            "FUTU_PORT",
            "FUTU_SYMBOLS",
            "DATA_ROOT",
            "BATCH_SIZE",
            "FUTU_POLL_ENABLED",
            "PERSIST_RETRY_BACKOFF_SEC",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn missing_symbols_fails_startup() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_known_vars();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FUTU_SYMBOLS")));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_known_vars();
        std::env::set_var("FUTU_SYMBOLS", "00700,00005");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.futu_host, "127.0.0.1");
        assert_eq!(cfg.futu_port, 11111);
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.futu_symbols, vec!["00700".to_string(), "00005".to_string()]);
        std::env::remove_var("FUTU_SYMBOLS");
    }

    #[test]
    fn symbol_universe_pairs_with_fixed_market() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_known_vars();
        std::env::set_var("FUTU_SYMBOLS", "00700");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.symbol_universe(), vec![("HK".to_string(), "00700".to_string())]);
        std::env::remove_var("FUTU_SYMBOLS");
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_known_vars();
        std::env::set_var("FUTU_SYMBOLS", "00700");
        std::env::set_var("FUTU_POLL_ENABLED", "maybe");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FUTU_POLL_ENABLED", .. }));
        std::env::remove_var("FUTU_SYMBOLS");
        std::env::remove_var("FUTU_POLL_ENABLED");
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_known_vars();
        std::env::set_var("FUTU_SYMBOLS", "00700");
        let cfg = Config::from_env().unwrap();
        let (json_a, hash_a) = cfg.fingerprint();
        let (json_b, hash_b) = cfg.fingerprint();
        assert_eq!(json_a, json_b);
        assert_eq!(hash_a, hash_b);
        std::env::remove_var("FUTU_SYMBOLS");
    }
}
