//! Leader Lease Configuration
//!
//! This module provides configuration structures for the election engine
//! and for the `leader-lease` binary that hosts it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum length of a schema or table identifier (PostgreSQL NAMEDATALEN - 1)
const MAX_IDENTIFIER_LEN: usize = 63;

/// Configuration file consumed by the `leader-lease` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLeaseConfig {
    /// Shared store connection
    pub database: DatabaseConfig,

    /// Election engine configuration
    #[serde(default)]
    pub election: LeaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`postgres://...`, `sqlite://path` or `sqlite::memory:`)
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Which store adapter a database URL selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Path to the database file, `None` for an in-memory database
    Sqlite(Option<PathBuf>),
}

/// Election engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a claimed lease stays valid without renewal
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Delay between acquire/renew attempts (defaults to a third of the lease)
    #[serde(default)]
    pub renewal_interval_ms: Option<u64>,

    /// Delay between reclaimer passes (defaults to six leases)
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,

    /// Width of the uniform random offset added to every scheduled delay
    #[serde(default = "default_jitter_range_ms")]
    pub jitter_range_ms: u64,

    /// How long past expiry a row must be before the reclaimer deletes it
    #[serde(default = "default_reclaim_grace_ms")]
    pub reclaim_grace_ms: u64,

    /// Upper bound on a single acquire/renew round trip (defaults to the renewal interval)
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,

    /// Lock identifier partitioning independent leases in one table
    #[serde(default = "default_lock_id")]
    pub lock_id: i64,

    /// Identifier written as `leader_id` (random when unset)
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Schema holding the lease table
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Lease table name
    #[serde(default = "default_table")]
    pub table: String,

    /// Create the lease table on startup if it does not exist
    #[serde(default = "default_true")]
    pub create_table_on_init: bool,

    /// Only run the reclaimer while this instance is leader
    #[serde(default)]
    pub reclaim_on_leader_only: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_pool_size() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_lease_duration_ms() -> u64 {
    15_000
}

fn default_jitter_range_ms() -> u64 {
    2_000
}

fn default_reclaim_grace_ms() -> u64 {
    5_000
}

fn default_lock_id() -> i64 {
    1
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "leader_lease".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            renewal_interval_ms: None,
            cleanup_interval_ms: None,
            jitter_range_ms: default_jitter_range_ms(),
            reclaim_grace_ms: default_reclaim_grace_ms(),
            attempt_timeout_ms: None,
            lock_id: default_lock_id(),
            instance_id: None,
            schema: default_schema(),
            table: default_table(),
            create_table_on_init: true,
            reclaim_on_leader_only: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LeaseConfig {
    /// Get lease duration as Duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Get renewal interval as Duration
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(
            self.renewal_interval_ms
                .unwrap_or(self.lease_duration_ms / 3),
        )
    }

    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(
            self.cleanup_interval_ms
                .unwrap_or(self.lease_duration_ms.saturating_mul(6)),
        )
    }

    /// Get jitter range as Duration
    pub fn jitter_range(&self) -> Duration {
        Duration::from_millis(self.jitter_range_ms)
    }

    /// Get reclaim grace window as Duration
    pub fn reclaim_grace(&self) -> Duration {
        Duration::from_millis(self.reclaim_grace_ms)
    }

    /// Get attempt timeout as Duration
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.renewal_interval())
    }

    /// Schema-qualified table name
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.lease_duration_ms == 0 {
            return Err(crate::Error::Config("lease_duration_ms must be positive".into()));
        }

        if self.renewal_interval().is_zero() {
            return Err(crate::Error::Config("renewal_interval_ms must be positive".into()));
        }

        if self.cleanup_interval().is_zero() {
            return Err(crate::Error::Config("cleanup_interval_ms must be positive".into()));
        }

        if self.attempt_timeout().is_zero() {
            return Err(crate::Error::Config("attempt_timeout_ms must be positive".into()));
        }

        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(crate::Error::Config("instance_id cannot be empty".into()));
            }
        }

        validate_identifier("schema", &self.schema)?;
        validate_identifier("table", &self.table)?;

        Ok(())
    }
}

/// Schema and table names are interpolated into SQL text, so only plain
/// identifiers are accepted.
fn validate_identifier(field: &str, value: &str) -> crate::Result<()> {
    let mut chars = value.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || value.len() > MAX_IDENTIFIER_LEN {
        return Err(crate::Error::Config(format!(
            "{} {:?} is not a valid SQL identifier",
            field, value
        )));
    }

    Ok(())
}

impl DatabaseConfig {
    /// Pick the store adapter from the URL scheme
    pub fn backend(&self) -> crate::Result<StoreBackend> {
        let url = self.url.trim();

        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(StoreBackend::Postgres);
        }

        if url == "sqlite::memory:" {
            return Ok(StoreBackend::Sqlite(None));
        }

        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(crate::Error::Config("sqlite url is missing a path".into()));
            }
            return Ok(StoreBackend::Sqlite(Some(PathBuf::from(path))));
        }

        Err(crate::Error::Config(format!(
            "unsupported database url scheme: {}",
            url.split("://").next().unwrap_or(url)
        )))
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl LeaderLeaseConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LeaderLeaseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.database.url.is_empty() {
            return Err(crate::Error::Config("database.url cannot be empty".into()));
        }

        if self.database.pool_size == 0 {
            return Err(crate::Error::Config("database.pool_size must be positive".into()));
        }

        self.database.backend()?;

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or json, got {:?}",
                    other
                )))
            }
        }

        self.election.validate()
    }
}
