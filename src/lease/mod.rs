//! Lease Store
//!
//! The lease row is the only shared state between instances. Every
//! operation here runs in its own store transaction and reports contention
//! as [`Error::WriteRejected`](crate::Error::WriteRejected), independent of
//! how the backing store surfaces it.

pub mod postgres;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use postgres::PgLeaseStore;
pub use sqlite::SqliteLeaseStore;

/// One persisted lease row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lock identifier (primary key)
    pub id: i64,
    /// Instance currently (or most recently) claiming the lease
    pub leader_id: String,
    /// Moment after which the lease is stale
    pub expires_at: DateTime<Utc>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
}

impl Lease {
    /// Check if this lease has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Check if this lease has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if `instance_id` owns this lease
    pub fn is_held_by(&self, instance_id: &str) -> bool {
        self.leader_id == instance_id
    }
}

/// Conditional operations on lease rows.
///
/// Implementations MUST:
/// - make `try_claim` a single atomic conditional write that succeeds only
///   when the row is absent, expired, or already owned by `leader_id`,
/// - scope `release` to both the lock id and the leader id,
/// - map driver errors to `WriteRejected`, `SchemaMissing` or
///   `TransientStore` so callers never branch on a specific store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Short label used in logs
    fn backend(&self) -> &'static str;

    /// Create the lease table and its indexes if they do not exist
    async fn ensure_table(&self) -> Result<()>;

    /// Check whether the lease table exists
    async fn table_exists(&self) -> Result<bool>;

    /// Acquire or renew the lease for `lock_id` on behalf of `leader_id`.
    ///
    /// Returns the row as written, or `Error::WriteRejected` when another
    /// instance holds an unexpired lease.
    async fn try_claim(&self, lock_id: i64, leader_id: &str, duration: Duration) -> Result<Lease>;

    /// Delete the row for `lock_id` if `leader_id` owns it.
    ///
    /// Returns `true` when a row was removed.
    async fn release(&self, lock_id: i64, leader_id: &str) -> Result<bool>;

    /// Delete every row whose lease expired more than `grace` ago.
    ///
    /// Returns the number of rows removed.
    async fn reclaim(&self, grace: Duration) -> Result<u64>;

    /// Read the current row for `lock_id`
    async fn current(&self, lock_id: i64) -> Result<Option<Lease>>;
}

/// Convert a std duration to milliseconds for SQL parameters
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = Lease {
            id: 1,
            leader_id: "node-a".into(),
            expires_at: now + chrono::Duration::seconds(10),
            created_at: now,
        };

        assert!(!lease.is_expired_at(now));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(10)));
        assert!(lease.is_held_by("node-a"));
        assert!(!lease.is_held_by("node-b"));
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), i64::MAX);
    }
}
