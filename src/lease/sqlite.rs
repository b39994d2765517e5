//! SQLite Lease Store
//!
//! Embedded lease store for instances sharing one host, and for tests.
//! SQLite has a single namespace per database file, so only the table name
//! from the configuration is used. Timestamps are stored as milliseconds
//! since the Unix epoch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use super::{duration_millis, Lease, LeaseStore};
use crate::config::LeaseConfig;
use crate::error::{Error, Result};

/// Upper bound on how long a writer waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Lease store backed by a SQLite connection.
///
/// Clones share the same connection. Calls run synchronously on the calling
/// task, so an async timeout cannot cut one short; lock waits are bounded by
/// the connection's busy timeout instead, which never exceeds the configured
/// attempt timeout.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    /// Database connection
    conn: Arc<Mutex<Connection>>,
    /// Lease table name
    table: String,
}

impl std::fmt::Debug for SqliteLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLeaseStore")
            .field("table", &self.table)
            .finish()
    }
}

impl SqliteLeaseStore {
    /// Open or create a database file
    pub fn open(path: &Path, lease: &LeaseConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(lease.attempt_timeout().min(BUSY_TIMEOUT))?;
        Ok(Self::from_connection(conn, lease))
    }

    /// Open a private in-memory database
    pub fn open_in_memory(lease: &LeaseConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, lease))
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: Connection, lease: &LeaseConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            table: lease.table.clone(),
        }
    }

    fn map_err(&self, err: rusqlite::Error, lock_id: i64) -> Error {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            if failure.code == ErrorCode::ConstraintViolation {
                return Error::WriteRejected { lock_id };
            }
            if message
                .as_deref()
                .is_some_and(|m| m.starts_with("no such table"))
            {
                return Error::SchemaMissing {
                    table: self.table.clone(),
                };
            }
        }
        Error::TransientStore(format!("SQLite error: {}", err))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lease_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        id: row.get(0)?,
        leader_id: row.get(1)?,
        expires_at: from_millis(row.get(2)?),
        created_at: from_millis(row.get(3)?),
    })
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_table(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id          INTEGER PRIMARY KEY,
                leader_id   TEXT NOT NULL,
                expires_at  INTEGER NOT NULL,
                created_at  INTEGER NOT NULL
                    DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)),
                CHECK (expires_at > created_at)
            );

            CREATE INDEX IF NOT EXISTS {table}_expires_at_idx
                ON {table} (expires_at);
            "#,
            table = self.table,
        ))
        .map_err(|e| self.map_err(e, 0))?;
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |row| row.get(0),
            )
            .map_err(|e| self.map_err(e, 0))?;
        Ok(count > 0)
    }

    async fn try_claim(&self, lock_id: i64, leader_id: &str, duration: Duration) -> Result<Lease> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.map_err(e, lock_id))?;

        let now = now_millis();
        let expires_at = now.saturating_add(duration_millis(duration));

        let lease = tx
            .query_row(
                &format!(
                    r#"
                    INSERT INTO {table} (id, leader_id, expires_at, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(id) DO UPDATE
                        SET leader_id = excluded.leader_id,
                            expires_at = excluded.expires_at
                        WHERE {table}.expires_at <= ?4
                           OR {table}.leader_id = excluded.leader_id
                    RETURNING id, leader_id, expires_at, created_at
                    "#,
                    table = self.table,
                ),
                params![lock_id, leader_id, expires_at, now],
                lease_from_row,
            )
            .optional()
            .map_err(|e| self.map_err(e, lock_id))?;

        let Some(lease) = lease else {
            // Dropping the transaction rolls it back
            return Err(Error::WriteRejected { lock_id });
        };

        tx.commit().map_err(|e| self.map_err(e, lock_id))?;
        Ok(lease)
    }

    async fn release(&self, lock_id: i64, leader_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.map_err(e, lock_id))?;

        let deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1 AND leader_id = ?2", self.table),
                params![lock_id, leader_id],
            )
            .map_err(|e| self.map_err(e, lock_id))?;

        tx.commit().map_err(|e| self.map_err(e, lock_id))?;
        Ok(deleted > 0)
    }

    async fn reclaim(&self, grace: Duration) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.map_err(e, 0))?;

        let cutoff = now_millis().saturating_sub(duration_millis(grace));
        let deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE expires_at < ?1", self.table),
                params![cutoff],
            )
            .map_err(|e| self.map_err(e, 0))?;

        tx.commit().map_err(|e| self.map_err(e, 0))?;
        Ok(deleted as u64)
    }

    async fn current(&self, lock_id: i64) -> Result<Option<Lease>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT id, leader_id, expires_at, created_at FROM {} WHERE id = ?1",
                self.table
            ),
            params![lock_id],
            lease_from_row,
        )
        .optional()
        .map_err(|e| self.map_err(e, lock_id))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sqlite(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(10);

    async fn store() -> SqliteLeaseStore {
        let store = SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap();
        store.ensure_table().await.unwrap();
        store
    }

    /// Rewrite a row's expiry as if it had been claimed `ago` in the past
    async fn backdate(store: &SqliteLeaseStore, lock_id: i64, ago: Duration) {
        let conn = store.conn.lock().await;
        let expires_at = now_millis() - duration_millis(ago);
        conn.execute(
            "UPDATE leader_lease SET expires_at = ?1, created_at = ?1 - 1 WHERE id = ?2",
            params![expires_at, lock_id],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let store = SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap();
        assert!(!store.table_exists().await.unwrap());

        store.ensure_table().await.unwrap();
        store.ensure_table().await.unwrap();
        assert!(store.table_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_maps_to_schema_missing() {
        let store = SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap();
        let err = store.try_claim(1, "node-a", TTL).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMissing { .. }));
    }

    #[tokio::test]
    async fn test_claim_and_renew() {
        let store = store().await;

        let first = store.try_claim(1, "node-a", TTL).await.unwrap();
        assert_eq!(first.id, 1);
        assert!(first.is_held_by("node-a"));
        assert!(first.expires_at > first.created_at);

        let renewed = store.try_claim(1, "node-a", TTL).await.unwrap();
        assert!(renewed.is_held_by("node-a"));
        assert!(renewed.expires_at >= first.expires_at);
        assert_eq!(renewed.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_valid_lease_rejects_other_instance() {
        let store = store().await;
        store.try_claim(1, "node-a", TTL).await.unwrap();

        let err = store.try_claim(1, "node-b", TTL).await.unwrap_err();
        assert!(err.is_rejection());

        let current = store.current(1).await.unwrap().unwrap();
        assert!(current.is_held_by("node-a"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = store().await;
        store.try_claim(1, "node-a", TTL).await.unwrap();
        backdate(&store, 1, Duration::from_millis(1)).await;

        let lease = store.try_claim(1, "node-b", TTL).await.unwrap();
        assert!(lease.is_held_by("node-b"));
        assert!(!lease.is_expired());
    }

    #[tokio::test]
    async fn test_lock_ids_are_independent() {
        let store = store().await;
        store.try_claim(1, "node-a", TTL).await.unwrap();
        let other = store.try_claim(2, "node-b", TTL).await.unwrap();
        assert!(other.is_held_by("node-b"));
    }

    #[tokio::test]
    async fn test_release_is_scoped_to_owner() {
        let store = store().await;
        store.try_claim(1, "node-a", TTL).await.unwrap();

        assert!(!store.release(1, "node-b").await.unwrap());
        assert!(store.current(1).await.unwrap().is_some());

        assert!(store.release(1, "node-a").await.unwrap());
        assert!(!store.release(1, "node-a").await.unwrap());
        assert!(store.current(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_respects_grace_window() {
        let store = store().await;
        store.try_claim(1, "node-a", TTL).await.unwrap();
        store.try_claim(2, "node-a", TTL).await.unwrap();
        store.try_claim(3, "node-a", TTL).await.unwrap();

        // 1: expired just now, inside the grace window
        backdate(&store, 1, Duration::from_millis(100)).await;
        // 2: expired long ago
        backdate(&store, 2, Duration::from_secs(60)).await;
        // 3: still valid

        let deleted = store.reclaim(Duration::from_secs(5)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.current(1).await.unwrap().is_some());
        assert!(store.current(2).await.unwrap().is_none());
        assert!(store.current(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_wait_bounded_by_attempt_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lease.db");
        let config = LeaseConfig {
            attempt_timeout_ms: Some(200),
            ..LeaseConfig::default()
        };

        let store = SqliteLeaseStore::open(&path, &config).unwrap();
        store.ensure_table().await.unwrap();
        {
            let conn = store.conn.lock().await;
            let busy: i64 = conn
                .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
                .unwrap();
            assert_eq!(busy, 200);
        }

        // Another process holds the write lock
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let err = store.try_claim(1, "node-a", TTL).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(900));

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(store.try_claim(1, "node-a", TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_separate_connections_share_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lease.db");
        let config = LeaseConfig::default();

        let a = SqliteLeaseStore::open(&path, &config).unwrap();
        let b = SqliteLeaseStore::open(&path, &config).unwrap();
        a.ensure_table().await.unwrap();
        assert!(b.table_exists().await.unwrap());

        a.try_claim(7, "node-a", TTL).await.unwrap();
        assert!(b.try_claim(7, "node-b", TTL).await.unwrap_err().is_rejection());
        assert!(b.current(7).await.unwrap().unwrap().is_held_by("node-a"));
    }
}
