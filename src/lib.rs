//! Leader Lease - Lease-Based Leader Election over SQL
//!
//! Lets several equivalent process instances agree on exactly one leader by
//! competing for a time-bounded lease row in a shared transactional store.
//!
//! # Architecture
//!
//! Instances never talk to each other. Each one periodically runs a single
//! conditional upsert against the lease row: it succeeds only when the row is
//! absent, expired, or already owned by the caller. The store's transaction
//! isolation is the only tie-break, so no quorum or heartbeat channel is
//! needed.
//!
//! # Features
//!
//! - PostgreSQL lease store (server clock, `TIMESTAMPTZ` expiry)
//! - Embedded SQLite lease store for single-host deployments
//! - Jittered single-shot renewal timer, never overlapping attempts
//! - Scoped release on shutdown for immediate handover
//! - Background reclaimer for rows abandoned by crashed instances
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use leader_lease::prelude::*;
//!
//! # async fn run() -> leader_lease::Result<()> {
//! let config = LeaseConfig::default();
//! let store = SqliteLeaseStore::open(std::path::Path::new("/tmp/lease.db"), &config)?;
//! let election = LeaderElection::create(Arc::new(store), config).await?;
//!
//! if election.am_i_leader() {
//!     // leader-only work
//! }
//!
//! election.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod election;
pub mod error;
pub mod lease;

pub use config::{LeaderLeaseConfig, LeaseConfig};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LeaderLeaseConfig, LeaseConfig};
    pub use crate::election::{ElectionState, LeaderElection};
    pub use crate::error::{Error, Result};
    pub use crate::lease::{Lease, LeaseStore, PgLeaseStore, SqliteLeaseStore};
}
