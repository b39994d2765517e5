//! Leader Lease Error Types

use thiserror::Error;

/// Result type alias for leader lease operations
pub type Result<T> = std::result::Result<T, Error>;

/// Leader lease error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lease protocol outcomes
    #[error("Lease {lock_id} is held by another instance")]
    WriteRejected { lock_id: i64 },

    #[error("Transient store failure: {0}")]
    TransientStore(String),

    #[error("Lease table {table} does not exist and auto-creation is disabled")]
    SchemaMissing { table: String },

    #[error("Reclaim failed: {0}")]
    ReclaimFailure(String),

    // Driver errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lease operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Another instance currently owns a valid lease. Expected under
    /// contention, not a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::WriteRejected { .. })
    }

    /// Check if this error is retried on the next scheduled attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientStore(_)
                | Error::Database(_)
                | Error::Sqlite(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must abort engine construction
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::SchemaMissing { .. } | Error::Config(_) | Error::ConfigParse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_classification() {
        let rejected = Error::WriteRejected { lock_id: 1 };
        assert!(rejected.is_rejection());
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_fatal_at_startup());

        let transient = Error::TransientStore("connection reset".into());
        assert!(!transient.is_rejection());
        assert!(transient.is_retryable());

        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());

        let missing = Error::SchemaMissing {
            table: "public.leader_lease".into(),
        };
        assert!(missing.is_fatal_at_startup());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::WriteRejected { lock_id: 7 };
        assert_eq!(err.to_string(), "Lease 7 is held by another instance");
    }
}
