//! Error types for the replication engine
//!
//! One crate-wide error enum with classification for retry decisions and
//! operator alerting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Target database errors (connection, statement execution)
    Database,
    /// Replication stream errors (admission, watermarks, queue handling)
    Replication,
    /// Schema-related errors (introspection, DDL, dependency ordering)
    Schema,
    /// Configuration errors (invalid settings, unknown dialect)
    Configuration,
    /// Message-bus protocol violations (quorum ordering, duplicates)
    Protocol,
    /// Serialization errors (record payloads, persisted state)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Replication engine errors
#[derive(Error, Debug)]
pub enum ReplError {
    /// Target database reported an error
    #[error("Database error: {0}")]
    Database(String),

    /// Connection to the target database was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Lock wait or statement timeout on the target database
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Deadlock reported by the target database
    #[error("Deadlock detected: {0}")]
    DeadlockDetected(String),

    /// Replication stream error
    #[error("Replication error: {0}")]
    Replication(String),

    /// A foreign-key cycle among the given tables prevents bootstrap ordering
    #[error("Foreign-key cycle among tables after {sweeps} sweeps: {tables:?}")]
    DependencyCycle {
        /// Sweeps executed before giving up
        sweeps: usize,
        /// Tables still unresolved when the sweep cap was hit
        tables: Vec<String>,
    },

    /// Table introspection failed
    #[error("Introspection failed for '{table}': {reason}")]
    Introspection {
        /// Qualified table name
        table: String,
        /// Backend failure text
        reason: String,
    },

    /// Schema error (DDL generation, description mismatch)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Message-bus protocol violation (quorum ordering, duplicate response)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// State not valid for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ReplError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a connection-lost error
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a deadlock error
    pub fn deadlock(msg: impl Into<String>) -> Self {
        Self::DeadlockDetected(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient backend errors that may succeed after
    /// backing off and re-reserving a connection.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionLost(_) => true,
            Self::Timeout(_) => true,
            Self::DeadlockDetected(_) => true,

            Self::Database(msg) => {
                msg.contains("connection reset")
                    || msg.contains("connection lost")
                    || msg.contains("temporarily")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Replication(_)
            | Self::DependencyCycle { .. }
            | Self::Introspection { .. }
            | Self::Schema(_)
            | Self::Protocol(_)
            | Self::Config(_)
            | Self::InvalidState(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Database(_) | Self::DeadlockDetected(_) => ErrorCategory::Database,
            Self::ConnectionLost(_) | Self::Timeout(_) => ErrorCategory::Database,
            Self::Replication(_) => ErrorCategory::Replication,
            Self::DependencyCycle { .. } => ErrorCategory::Schema,
            Self::Introspection { .. } => ErrorCategory::Schema,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Other,
            Self::InvalidState(_) | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "database_error",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Timeout(_) => "timeout",
            Self::DeadlockDetected(_) => "deadlock",
            Self::Replication(_) => "replication_error",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::Introspection { .. } => "introspection_error",
            Self::Schema(_) => "schema_error",
            Self::Protocol(_) => "protocol_error",
            Self::Config(_) => "config_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplError>;
