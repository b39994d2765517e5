//! PostgreSQL Lease Store
//!
//! Keeps the lease row in a `TIMESTAMPTZ` table and uses the server's
//! `now()` for every expiry comparison, so instances never compare their
//! own clocks against each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{duration_millis, Lease, LeaseStore};
use crate::config::{DatabaseConfig, LeaseConfig};
use crate::error::{Error, Result};

/// SQLSTATE codes the store maps onto lease outcomes
const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const UNDEFINED_TABLE: &str = "42P01";

type LeaseRow = (i64, String, DateTime<Utc>, DateTime<Utc>);

/// How a SQLSTATE is surfaced to the election engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Rejected,
    SchemaMissing,
    Transient,
}

fn classify_sqlstate(code: Option<&str>) -> Outcome {
    match code {
        Some(UNIQUE_VIOLATION) | Some(SERIALIZATION_FAILURE) => Outcome::Rejected,
        Some(UNDEFINED_TABLE) => Outcome::SchemaMissing,
        _ => Outcome::Transient,
    }
}

/// Lease store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgLeaseStore {
    /// Connect a new pool and bind it to the configured lease table
    pub async fn connect(database: &DatabaseConfig, lease: &LeaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(database.pool_size)
            .acquire_timeout(database.connect_timeout())
            .connect(&database.url)
            .await?;

        tracing::debug!("Connected PostgreSQL pool (max {} connections)", database.pool_size);

        Ok(Self::from_pool(pool, lease))
    }

    /// Bind an existing pool to the configured lease table
    pub fn from_pool(pool: PgPool, lease: &LeaseConfig) -> Self {
        Self {
            pool,
            schema: lease.schema.clone(),
            table: lease.table.clone(),
        }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn map_err(&self, err: sqlx::Error, lock_id: i64) -> Error {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };

        match classify_sqlstate(code.as_deref()) {
            Outcome::Rejected => Error::WriteRejected { lock_id },
            Outcome::SchemaMissing => Error::SchemaMissing {
                table: self.qualified(),
            },
            Outcome::Transient => Error::TransientStore(err.to_string()),
        }
    }

    fn create_statements(&self) -> Vec<String> {
        let qualified = self.qualified();
        let mut statements = Vec::with_capacity(3);

        // CREATE SCHEMA needs database-level privileges even when the
        // schema already exists.
        if self.schema != "public" {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema));
        }

        statements.push(format!(
            r#"
            CREATE TABLE IF NOT EXISTS {qualified} (
                id          BIGINT PRIMARY KEY,
                leader_id   TEXT NOT NULL,
                expires_at  TIMESTAMPTZ NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT {table}_expiry_after_creation CHECK (expires_at > created_at)
            )
            "#,
            qualified = qualified,
            table = self.table,
        ));

        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_expires_at_idx ON {qualified} (expires_at)",
            table = self.table,
            qualified = qualified,
        ));

        statements
    }

    fn claim_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {qualified} AS lease (id, leader_id, expires_at)
            VALUES ($1, $2, now() + $3::bigint * interval '1 millisecond')
            ON CONFLICT (id) DO UPDATE
                SET leader_id = EXCLUDED.leader_id,
                    expires_at = EXCLUDED.expires_at
                WHERE lease.expires_at <= now()
                   OR lease.leader_id = EXCLUDED.leader_id
            RETURNING id, leader_id, expires_at, created_at
            "#,
            qualified = self.qualified(),
        )
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_table(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| self.map_err(e, 0))?;

        for sql in self.create_statements() {
            if let Err(e) = sqlx::query(&sql).execute(&mut *tx).await {
                // Two instances racing CREATE TABLE IF NOT EXISTS collide on
                // the catalog; the loser finds the table on its next check.
                if classify_sqlstate(
                    e.as_database_error().and_then(|d| d.code()).as_deref(),
                ) == Outcome::Rejected
                {
                    tracing::debug!("Lease table created concurrently by another instance");
                    return Ok(());
                }
                return Err(self.map_err(e, 0));
            }
        }

        tx.commit().await.map_err(|e| self.map_err(e, 0))?;
        tracing::debug!("Ensured lease table {}", self.qualified());
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
            .bind(self.qualified())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.map_err(e, 0))?;
        Ok(exists)
    }

    async fn try_claim(&self, lock_id: i64, leader_id: &str, duration: Duration) -> Result<Lease> {
        let mut tx = self.pool.begin().await.map_err(|e| self.map_err(e, lock_id))?;

        let row: Option<LeaseRow> = sqlx::query_as(&self.claim_sql())
            .bind(lock_id)
            .bind(leader_id)
            .bind(duration_millis(duration))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| self.map_err(e, lock_id))?;

        let Some((id, leader_id, expires_at, created_at)) = row else {
            // Dropping the transaction rolls it back
            return Err(Error::WriteRejected { lock_id });
        };

        tx.commit().await.map_err(|e| self.map_err(e, lock_id))?;

        Ok(Lease {
            id,
            leader_id,
            expires_at,
            created_at,
        })
    }

    async fn release(&self, lock_id: i64, leader_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| self.map_err(e, lock_id))?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1 AND leader_id = $2",
            self.qualified()
        ))
        .bind(lock_id)
        .bind(leader_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| self.map_err(e, lock_id))?;

        tx.commit().await.map_err(|e| self.map_err(e, lock_id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim(&self, grace: Duration) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| self.map_err(e, 0))?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at < now() - $1::bigint * interval '1 millisecond'",
            self.qualified()
        ))
        .bind(duration_millis(grace))
        .execute(&mut *tx)
        .await
        .map_err(|e| self.map_err(e, 0))?;

        tx.commit().await.map_err(|e| self.map_err(e, 0))?;
        Ok(result.rows_affected())
    }

    async fn current(&self, lock_id: i64) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = sqlx::query_as(&format!(
            "SELECT id, leader_id, expires_at, created_at FROM {} WHERE id = $1",
            self.qualified()
        ))
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.map_err(e, lock_id))?;

        Ok(row.map(|(id, leader_id, expires_at, created_at)| Lease {
            id,
            leader_id,
            expires_at,
            created_at,
        }))
    }
}
