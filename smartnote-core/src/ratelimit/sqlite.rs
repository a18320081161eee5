//! Shared SQLite store for processes that must split one budget.
//!
//! Every `allow` runs inside a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front, so two processes can never both count the
//! same bucket below its limit before either records a hit.
//!
//! Each row carries its own expiry, so a periodic sweep can drop the hits of
//! idle buckets without knowing their windows. The time of the last sweep
//! lives in the database, shared by every process using it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use tracing::debug;

use super::window::{CLEANUP_INTERVAL_SECS, MIN_RETRY_AFTER_SECS};
use super::{RateLimitStore, WindowOutcome};
use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Create the parent directory and schema if needed.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS rate_limit_hits (
              bucket_key TEXT NOT NULL,
              ts REAL NOT NULL,
              expires_at REAL NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS rate_limit_meta (
              key TEXT PRIMARY KEY,
              value REAL NOT NULL
            );
            "#,
        )?;
        // Databases created before rows carried an expiry.
        let has_expiry: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('rate_limit_hits') WHERE name = 'expires_at'")?
            .exists([])?;
        if !has_expiry {
            conn.execute_batch(
                "ALTER TABLE rate_limit_hits ADD COLUMN expires_at REAL NOT NULL DEFAULT 0",
            )?;
        }
        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_rate_limit_bucket_ts
              ON rate_limit_hits(bucket_key, ts);
            CREATE INDEX IF NOT EXISTS idx_rate_limit_expires
              ON rate_limit_hits(expires_at);
            "#,
        )?;
        Ok(())
    }

    /// Delete every row whose window has ended, across all buckets. Returns
    /// the number of rows removed.
    pub fn purge_expired(&self, now: f64) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM rate_limit_hits WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }

    /// Rows currently stored, expired or not.
    pub fn row_count(&self) -> Result<u64> {
        let conn = self.open()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM rate_limit_hits", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

/// Run the global sweep if the last one is older than the cleanup interval.
fn sweep_if_due(tx: &rusqlite::Transaction<'_>, now: f64) -> Result<()> {
    let last: Option<f64> = tx
        .query_row(
            "SELECT value FROM rate_limit_meta WHERE key = 'last_sweep'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if last.is_some_and(|t| now - t < CLEANUP_INTERVAL_SECS) {
        return Ok(());
    }
    let removed = tx.execute(
        "DELETE FROM rate_limit_hits WHERE expires_at <= ?1",
        params![now],
    )?;
    tx.execute(
        "INSERT INTO rate_limit_meta (key, value) VALUES ('last_sweep', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![now],
    )?;
    if removed > 0 {
        debug!(removed, "swept expired rate-limit rows");
    }
    Ok(())
}

impl RateLimitStore for SqliteStore {
    fn allow(
        &self,
        bucket_key: &str,
        max_requests: u32,
        window_secs: f64,
        now: f64,
    ) -> Result<WindowOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = now - window_secs;

        sweep_if_due(&tx, now)?;
        tx.execute(
            "DELETE FROM rate_limit_hits WHERE bucket_key = ?1 AND ts <= ?2",
            params![bucket_key, cutoff],
        )?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM rate_limit_hits WHERE bucket_key = ?1",
            params![bucket_key],
            |row| row.get(0),
        )?;
        let count = count.max(0) as u64;
        let max = u64::from(max_requests);

        let outcome = if count >= max {
            let oldest: Option<f64> = tx
                .query_row(
                    "SELECT MIN(ts) FROM rate_limit_hits WHERE bucket_key = ?1",
                    params![bucket_key],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let retry_after = oldest
                .map(|t| t + window_secs - now)
                .unwrap_or(window_secs)
                .max(MIN_RETRY_AFTER_SECS);
            WindowOutcome {
                allowed: false,
                remaining: 0,
                retry_after,
            }
        } else {
            tx.execute(
                "INSERT INTO rate_limit_hits (bucket_key, ts, expires_at) VALUES (?1, ?2, ?3)",
                params![bucket_key, now, now + window_secs],
            )?;
            WindowOutcome {
                allowed: true,
                remaining: (max - count - 1) as u32,
                retry_after: 0.0,
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "smartnote-ratelimit-{tag}-{}-{:?}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        ))
    }

    #[test]
    fn rejects_past_limit_and_recovers_after_window() {
        let path = temp_db("unit");
        let store = SqliteStore::new(&path).expect("open store");

        for i in 0..3 {
            let out = store.allow("ip:heavy", 3, 60.0, i as f64).expect("allow");
            assert!(out.allowed);
            assert_eq!(out.remaining, 2 - i);
        }
        let rejected = store.allow("ip:heavy", 3, 60.0, 10.0).expect("allow");
        assert!(!rejected.allowed);
        assert!((rejected.retry_after - 50.0).abs() < 1e-9);

        // Other buckets are independent.
        assert!(store.allow("ip:light", 3, 60.0, 10.0).expect("allow").allowed);

        assert!(store.allow("ip:heavy", 3, 60.0, 60.0).expect("allow").allowed);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn purge_drops_expired_rows_of_every_bucket() {
        let path = temp_db("purge");
        let store = SqliteStore::new(&path).expect("open store");
        store.allow("a:light", 10, 60.0, 0.0).expect("allow");
        store.allow("b:heavy", 10, 600.0, 0.0).expect("allow");
        store.allow("c:light", 10, 60.0, 50.0).expect("allow");
        // Only the first row's window has ended at t=100.
        assert_eq!(store.purge_expired(100.0).expect("purge"), 1);
        assert_eq!(store.row_count().expect("count"), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn idle_buckets_are_swept_by_later_traffic() {
        let path = temp_db("sweep");
        let store = SqliteStore::new(&path).expect("open store");
        for i in 0..50 {
            store
                .allow(&format!("10.0.0.{i}:light"), 5, 60.0, 0.0)
                .expect("allow");
        }
        assert_eq!(store.row_count().expect("count"), 50);

        store.allow("10.0.1.1:light", 5, 60.0, 86_400.0).expect("allow");
        assert_eq!(store.row_count().expect("count"), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sweep_waits_for_the_cleanup_interval() {
        let path = temp_db("throttle");
        let store = SqliteStore::new(&path).expect("open store");
        store.allow("a:light", 5, 10.0, 0.0).expect("allow");
        // Expired, but the last sweep ran at t=0.
        store.allow("b:light", 5, 10.0, 100.0).expect("allow");
        assert_eq!(store.row_count().expect("count"), 2);

        store
            .allow("b:light", 5, 10.0, CLEANUP_INTERVAL_SECS + 1.0)
            .expect("allow");
        assert_eq!(store.row_count().expect("count"), 1);
        let _ = std::fs::remove_file(&path);
    }
}
