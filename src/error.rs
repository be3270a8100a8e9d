//! Error types for the bot store.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure to reach or authenticate against the relational store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Relational store {target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("Relational store {target} rejected the credentials")]
    BadCredentials { target: String },

    #[error("Relational store {target} has no such database: {reason}")]
    UnknownDatabase { target: String, reason: String },
}

impl ConnectionError {
    /// Classify a raw driver error message into a connection error.
    pub fn classify(target: &str, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("auth")
        {
            ConnectionError::BadCredentials {
                target: target.to_string(),
            }
        } else if lower.contains("404")
            || lower.contains("namespace")
            || lower.contains("unable to open database")
            || lower.contains("no such database")
        {
            ConnectionError::UnknownDatabase {
                target: target.to_string(),
                reason: message.to_string(),
            }
        } else {
            ConnectionError::Unreachable {
                target: target.to_string(),
                reason: message.to_string(),
            }
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Driver is closed")]
    Closed,

    #[error("Connection attempt was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema bootstrap failed: {0}")]
    Schema(String),

    #[error("Invalid SQL identifier or JSON path: {0}")]
    InvalidIdentifier(String),
}

impl DatabaseError {
    /// Map a libsql error raised by a statement, keeping integrity and
    /// connection failures distinguishable.
    pub fn from_statement(context: &str, target: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_ascii_lowercase();
        if lower.contains("constraint failed") || lower.contains("constraint violation") {
            return DatabaseError::Integrity(format!("{context}: {message}"));
        }
        if is_connection_failure(&lower) {
            return DatabaseError::Connection(ConnectionError::classify(target, &message));
        }
        DatabaseError::Query(format!("{context}: {message}"))
    }

    /// Whether this error means the connection itself is gone, which makes any
    /// open transaction unusable.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            DatabaseError::Connection(_)
                | DatabaseError::Timeout(_)
                | DatabaseError::Closed
                | DatabaseError::Cancelled
        )
    }
}

fn is_connection_failure(lower: &str) -> bool {
    [
        "connection refused",
        "connection reset",
        "connection closed",
        "broken pipe",
        "timed out",
        "error trying to connect",
        "stream not found",
        "dns error",
        "unauthorized",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// A legacy record failed its type/shape checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{collection}/{key}: field `{field}` {reason}")]
pub struct ValidationError {
    pub collection: String,
    pub key: String,
    pub field: String,
    pub reason: String,
}

/// A single record or batch failed to persist during transfer. Accumulated,
/// never raised on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{collection} [{target}]: {message}")]
pub struct TransferError {
    pub collection: String,
    /// Record key, or `batch N` for batched collections.
    pub target: String,
    pub message: String,
}

/// Migration-engine errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Legacy snapshot not found at {0}")]
    NotFound(PathBuf),

    #[error("Legacy snapshot at {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Validation failed in strict mode: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backup of {path} failed: {reason}")]
    Backup { path: PathBuf, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Transfer aborted, transaction rolled back: {0}")]
    TransactionFatal(String),
}

/// Errors surfaced through the controller's accessor surface.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{operation} is unavailable in fallback mode")]
    Unavailable { operation: String },

    #[error("Initialization exceeded its budget of {0:?}")]
    Timeout(Duration),

    #[error("Store has not been initialized")]
    NotInitialized,

    #[error("Store is closed")]
    Closed,

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Could not preserve {path} before repairing it: {reason}")]
    Preserve { path: PathBuf, reason: String },

    #[error("Startup failed and fallback is disabled: {0}")]
    Startup(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_refused_is_unreachable() {
        let err = ConnectionError::classify(
            "http://127.0.0.1:1",
            "error trying to connect: tcp connect error: Connection refused (os error 111)",
        );
        assert!(matches!(err, ConnectionError::Unreachable { .. }));
    }

    #[test]
    fn classify_unauthorized_is_bad_credentials() {
        let err = ConnectionError::classify("https://db.example", "HTTP error 401 Unauthorized");
        assert!(matches!(err, ConnectionError::BadCredentials { .. }));
    }

    #[test]
    fn classify_missing_namespace_is_unknown_database() {
        let err = ConnectionError::classify("https://db.example", "status 404: namespace `bots` does not exist");
        assert!(matches!(err, ConnectionError::UnknownDatabase { .. }));
    }

    #[test]
    fn connection_class_errors() {
        assert!(DatabaseError::Timeout(Duration::from_secs(1)).is_connection_class());
        assert!(DatabaseError::Closed.is_connection_class());
        assert!(!DatabaseError::Query("syntax".into()).is_connection_class());
    }
}
