//! Day-store writer: one embedded SQL file per trading day.
//!
//! Generalized from the teacher's Postgres connection/migration layer
//! (`connect_from_env`, `Context`-wrapped `sqlx` calls) to a per-day
//! SQLite file with the pragmas and idempotent insert-or-ignore pattern
//! the Data Model calls for.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use hkmd_model::Tick;

/// Connection pragmas applied on open, per the Data Model's "Applied
/// connection settings" list. Held as a value so the worker can tune them
/// from configuration without touching this crate.
#[derive(Debug, Clone, Copy)]
pub struct Pragmas {
    pub busy_timeout_ms: u32,
    pub wal_autocheckpoint_pages: u32,
}

impl Default for Pragmas {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wal_autocheckpoint_pages: 1_000,
        }
    }
}

/// Structured writer failure, classified by retry policy per spec.md
/// §4.4: `Busy` is transient (caller backs off and retries the same
/// batch); `DiskFull`/`ReadOnly`/`Io` are permanent-for-this-connection
/// (caller signals the worker to reconnect, batch retained); `Other` is
/// anything unrecognized, surfaced with its raw SQLite detail.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite busy/locked: {0}")]
    Busy(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("readonly: {0}")]
    ReadOnly(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Transient: the same batch should be retried after a backoff sleep,
    /// without rebuilding the connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }

    /// Permanent-for-this-connection: the batch is retained, but the
    /// worker should close and rebuild the writer before retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StoreError::DiskFull(_) | StoreError::ReadOnly(_) | StoreError::Io(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                // SQLITE_BUSY / SQLITE_LOCKED.
                Some("5") | Some("6") => return StoreError::Busy(message),
                // SQLITE_FULL.
                Some("13") => return StoreError::DiskFull(message),
                // SQLITE_READONLY and its extended-code family.
                Some(code) if code == "8" || code.starts_with("8") => {
                    return StoreError::ReadOnly(message)
                }
                // SQLITE_IOERR and its extended-code family.
                Some(code) if code == "10" || code.starts_with("10") => {
                    return StoreError::Io(message)
                }
                _ => {}
            }
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("database is locked") || lowered.contains("busy") {
                return StoreError::Busy(message);
            }
            if lowered.contains("disk") && lowered.contains("full") {
                return StoreError::DiskFull(message);
            }
            if lowered.contains("readonly") || lowered.contains("read-only") {
                return StoreError::ReadOnly(message);
            }
        }
        StoreError::Other(err.to_string())
    }
}

/// Exact counts from one commit, per spec.md §4.4: `inserted + ignored`
/// must equal the batch size, with no row silently disappearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertBatchResult {
    pub inserted: u64,
    pub ignored: u64,
}

impl InsertBatchResult {
    pub fn total(&self) -> u64 {
        self.inserted + self.ignored
    }
}

/// Owns a single connection to one trading day's embedded SQL file.
pub struct DayStoreWriter {
    pool: SqlitePool,
    path: PathBuf,
    trading_day: String,
}

impl DayStoreWriter {
    /// Opens (creating if necessary) `{root}/{trading_day}.db`. Does not
    /// itself apply schema/pragmas — call [`Self::ensure_schema`] after
    /// constructing, so a writer that is never committed to never leaves
    /// a file behind with side effects beyond its mere creation.
    pub async fn open(
        root: &Path,
        trading_day: &str,
        pragmas: Pragmas,
    ) -> Result<Self, StoreError> {
        let path = root.join(format!("{trading_day}.db"));
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(&format!(
            "PRAGMA busy_timeout = {};",
            pragmas.busy_timeout_ms
        ))
        .execute(&pool)
        .await?;
        sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL;").execute(&pool).await?;
        sqlx::query(&format!(
            "PRAGMA wal_autocheckpoint = {};",
            pragmas.wal_autocheckpoint_pages
        ))
        .execute(&pool)
        .await?;
        sqlx::query("PRAGMA temp_store = MEMORY;").execute(&pool).await?;

        Ok(Self {
            pool,
            path,
            trading_day: trading_day.to_string(),
        })
    }

    pub fn trading_day(&self) -> &str {
        &self.trading_day
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent: creates the table and the two partial unique indexes
    /// if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticks (
                market TEXT NOT NULL,
                symbol TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                recv_ts_ms INTEGER NOT NULL,
                price REAL,
                volume REAL,
                turnover REAL,
                direction TEXT,
                tick_type TEXT,
                push_type TEXT,
                provider TEXT,
                seq INTEGER,
                trading_day TEXT NOT NULL,
                inserted_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS u1_symbol_seq \
             ON ticks (symbol, seq) WHERE seq IS NOT NULL;",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS u2_symbol_ts_price_volume_turnover \
             ON ticks (symbol, ts_ms, price, volume, turnover) WHERE seq IS NULL;",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One explicit transaction; insert-or-ignore semantics so `U1`/`U2`
    /// conflicts are counted as `ignored` rather than surfaced as errors.
    /// `now_ms` is stamped as `inserted_at_ms` for every row that actually
    /// inserts.
    pub async fn insert_batch(
        &self,
        rows: &[Tick],
        now_ms: i64,
    ) -> Result<InsertBatchResult, StoreError> {
        let mut result = InsertBatchResult::default();
        if rows.is_empty() {
            return Ok(result);
        }

        let mut tx = self.pool.begin().await?;

        for row in rows {
            let outcome = sqlx::query(
                r#"
                INSERT OR IGNORE INTO ticks
                    (market, symbol, ts_ms, recv_ts_ms, price, volume, turnover,
                     direction, tick_type, push_type, provider, seq, trading_day,
                     inserted_at_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.market)
            .bind(&row.symbol)
            .bind(row.ts_ms)
            .bind(row.recv_ts_ms)
            .bind(row.price)
            .bind(row.volume)
            .bind(row.turnover)
            .bind(&row.direction)
            .bind(&row.tick_type)
            .bind(&row.push_type)
            .bind(&row.provider)
            .bind(row.seq)
            .bind(&row.trading_day)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

            if outcome.rows_affected() == 1 {
                result.inserted += 1;
            } else {
                result.ignored += 1;
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Approximate WAL size in bytes, for heartbeat reporting. Reads the
    /// sidecar `-wal` file's length directly rather than issuing a
    /// checkpoint (which would disturb the writer's own pacing).
    pub fn wal_size_estimate(&self) -> u64 {
        let wal_path = {
            let mut p = self.path.clone().into_os_string();
            p.push("-wal");
            PathBuf::from(p)
        };
        std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Flush and close the connection.
    pub async fn close(self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Seed sequence state by scanning up to `max_files` most recent day
/// files under `root` and returning, per `(symbol,)`, the maximum `seq`
/// observed across them. Never filtered by wall-clock recency — purely
/// by file name sort order, per the Data Model's seeding rule.
pub async fn scan_recent_max_seq(
    root: &Path,
    max_files: usize,
) -> Result<Vec<(String, i64)>, StoreError> {
    let mut day_files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("db") {
                day_files.push(path);
            }
        }
    }
    day_files.sort();
    day_files.reverse();
    day_files.truncate(max_files);

    let mut per_symbol_max: std::collections::HashMap<String, i64> = std::collections::HashMap::new();

    for path in day_files {
        let options = SqliteConnectOptions::new().filename(&path).read_only(true);
        let pool = match SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
        {
            Ok(pool) => pool,
            Err(_) => continue,
        };

        let rows = sqlx::query("SELECT symbol, MAX(seq) AS max_seq FROM ticks WHERE seq IS NOT NULL GROUP BY symbol")
            .fetch_all(&pool)
            .await;

        if let Ok(rows) = rows {
            for row in rows {
                let symbol: String = row.try_get("symbol").map_err(StoreError::from)?;
                let max_seq: i64 = row.try_get("max_seq").map_err(StoreError::from)?;
                per_symbol_max
                    .entry(symbol)
                    .and_modify(|m| *m = (*m).max(max_seq))
                    .or_insert(max_seq);
            }
        }

        pool.close().await;
    }

    Ok(per_symbol_max.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_tick(symbol: &str, seq: Option<i64>, ts_ms: i64) -> Tick {
        Tick {
            market: "HK".into(),
            symbol: symbol.into(),
            ts_ms,
            recv_ts_ms: ts_ms,
            price: Some(100.0),
            volume: Some(10.0),
            turnover: Some(1000.0),
            direction: None,
            tick_type: None,
            push_type: None,
            provider: None,
            seq,
            trading_day: "20260212".into(),
            inserted_at_ms: None,
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let writer = DayStoreWriter::open(dir.path(), "20260212", Pragmas::default())
            .await
            .unwrap();
        writer.ensure_schema().await.unwrap();
        writer.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn insert_batch_counts_are_exact_and_idempotent_on_replay() {
        let dir = tempdir().unwrap();
        let writer = DayStoreWriter::open(dir.path(), "20260212", Pragmas::default())
            .await
            .unwrap();
        writer.ensure_schema().await.unwrap();

        let rows = vec![
            sample_tick("00700", Some(1), 1_000),
            sample_tick("00700", Some(2), 2_000),
            sample_tick("00700", Some(3), 3_000),
        ];

        let r1 = writer.insert_batch(&rows, 9_999).await.unwrap();
        assert_eq!(r1.inserted, 3);
        assert_eq!(r1.ignored, 0);
        assert_eq!(r1.total(), rows.len() as u64);

        // Replaying the exact same batch must be fully absorbed as ignored.
        let r2 = writer.insert_batch(&rows, 9_999).await.unwrap();
        assert_eq!(r2.inserted, 0);
        assert_eq!(r2.ignored, 3);
    }

    #[tokio::test]
    async fn null_seq_rows_dedupe_on_composite_key() {
        let dir = tempdir().unwrap();
        let writer = DayStoreWriter::open(dir.path(), "20260212", Pragmas::default())
            .await
            .unwrap();
        writer.ensure_schema().await.unwrap();

        let row = sample_tick("00700", None, 1_000);
        let r1 = writer.insert_batch(&[row.clone()], 9_999).await.unwrap();
        assert_eq!(r1.inserted, 1);

        let r2 = writer.insert_batch(&[row], 9_999).await.unwrap();
        assert_eq!(r2.inserted, 0);
        assert_eq!(r2.ignored, 1);
    }

    #[tokio::test]
    async fn concurrent_writer_lock_is_classified_transient() {
        // Scenario 4 (spec.md §8): a writer attempt against an already
        // write-locked file must come back as `Busy`, not an unclassified
        // failure, so the worker knows to back off and retry rather than
        // rebuild the connection.
        let dir = tempdir().unwrap();
        let writer = DayStoreWriter::open(
            dir.path(),
            "20260212",
            Pragmas {
                busy_timeout_ms: 50,
                ..Pragmas::default()
            },
        )
        .await
        .unwrap();
        writer.ensure_schema().await.unwrap();

        // A second connection to the same file that grabs the write lock
        // via an uncommitted insert and holds it open.
        let locker_options = SqliteConnectOptions::new().filename(writer.path());
        let locker_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(locker_options)
            .await
            .unwrap();
        sqlx::query("PRAGMA busy_timeout = 0;")
            .execute(&locker_pool)
            .await
            .unwrap();
        let mut locker_tx = locker_pool.begin().await.unwrap();
        sqlx::query(
            "INSERT INTO ticks (market, symbol, ts_ms, recv_ts_ms, trading_day, inserted_at_ms) \
             VALUES ('HK', 'LOCKER', 1, 1, '20260212', 1)",
        )
        .execute(&mut *locker_tx)
        .await
        .unwrap();

        let rows = vec![sample_tick("00700", Some(1), 1_000)];
        let result = writer.insert_batch(&rows, 9_999).await;
        let err = result.expect_err("insert against a locked file must fail");
        assert!(err.is_transient(), "expected a transient Busy error, got {err:?}");

        locker_tx.rollback().await.unwrap();
        locker_pool.close().await;

        // Once the lock is released, the same batch succeeds.
        let retried = writer.insert_batch(&rows, 9_999).await.unwrap();
        assert_eq!(retried.inserted, 1);
    }

    #[tokio::test]
    async fn scan_recent_max_seq_picks_up_max_across_files() {
        let dir = tempdir().unwrap();
        let day1 = DayStoreWriter::open(dir.path(), "20260210", Pragmas::default())
            .await
            .unwrap();
        day1.ensure_schema().await.unwrap();
        day1.insert_batch(&[sample_tick("00700", Some(5), 1_000)], 0)
            .await
            .unwrap();
        day1.close().await.unwrap();

        let day2 = DayStoreWriter::open(dir.path(), "20260211", Pragmas::default())
            .await
            .unwrap();
        day2.ensure_schema().await.unwrap();
        day2.insert_batch(&[sample_tick("00700", Some(9), 2_000)], 0)
            .await
            .unwrap();
        day2.close().await.unwrap();

        let maxes = scan_recent_max_seq(dir.path(), 3).await.unwrap();
        let max_for_700 = maxes
            .into_iter()
            .find(|(s, _)| s == "00700")
            .map(|(_, m)| m);
        assert_eq!(max_for_700, Some(9));
    }
}
