//! Error types for evtrace operations
//!
//! Every fallible operation in the crate returns [`TraceError`]. Each variant
//! carries:
//! - A human-readable message
//! - A stable error code for programmatic handling
//! - A category matching the failure classes of the tracing client
//!
//! # Example
//!
//! ```rust
//! use evtrace_core::error::{ErrorCategory, TraceError};
//!
//! fn handle_error(err: TraceError) {
//!     match err.category() {
//!         ErrorCategory::Config => println!("fix the table list"),
//!         ErrorCategory::Io => println!("table is unusable"),
//!         _ => println!("other error"),
//!     }
//!
//!     if err.is_recoverable() {
//!         println!("retry may succeed");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientState;

/// Result type alias for evtrace operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Table not registered or configuration invalid
    Config,
    /// Output file could not be opened or appended
    Io,
    /// Payload could not be serialized
    Encode,
    /// Persisted data could not be parsed
    Decode,
    /// Remote collector failure
    Push,
    /// Client lifecycle (draining, closed)
    Lifecycle,
}

/// Errors that can occur while tracing
#[derive(Error, Debug)]
pub enum TraceError {
    // ═══════════════════════════════════════════════════════════════════════
    // Configuration errors
    // ═══════════════════════════════════════════════════════════════════════

    /// The event's table is not in the configured table list
    #[error("Table '{table}' is not registered. Add it to the traced tables to collect it.")]
    UnregisteredTable { table: String },

    /// Configuration failed validation
    #[error("Invalid trace configuration: {reason}")]
    InvalidConfig { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Table errors
    // ═══════════════════════════════════════════════════════════════════════

    /// The table file cannot be opened or appended; the table stays unusable
    #[error("Table '{table}' is unusable: {message}")]
    Io { table: String, message: String },

    /// The table is registered but nothing has been persisted for it yet
    #[error("Table '{table}' has no trace file yet")]
    TableNotFound { table: String },

    /// Payload serialization failed; the event was dropped
    #[error("Failed to encode event for table '{table}': {reason}")]
    Encode { table: String, reason: String },

    /// Remote collector rejected or did not receive a batch
    #[error("Push of table '{table}' failed: {reason}")]
    Push { table: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle errors
    // ═══════════════════════════════════════════════════════════════════════

    /// The client is not accepting writes
    #[error("Trace client is {state}, writes are not accepted")]
    NotRunning { state: ClientState },

    /// Shutdown could not persist every queue in time
    #[error("Shutdown timed out before draining tables: {}", tables.join(", "))]
    DrainTimeout { tables: Vec<String> },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure outside of a specific table
    #[error("IO error: {message}")]
    IoError { message: String },
}

impl TraceError {
    /// Shorthand for a table-scoped I/O failure
    pub(crate) fn io(table: &str, err: impl std::fmt::Display) -> Self {
        TraceError::Io {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    /// Returns true if this error might succeed on retry
    ///
    /// Unusable tables, unregistered tables and closed clients never recover
    /// for the lifetime of the client.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TraceError::Push { .. } | TraceError::TableNotFound { .. } | TraceError::IoError { .. }
        )
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            TraceError::UnregisteredTable { .. } | TraceError::InvalidConfig { .. } => {
                ErrorCategory::Config
            }

            TraceError::Io { .. }
            | TraceError::TableNotFound { .. }
            | TraceError::IoError { .. } => ErrorCategory::Io,

            TraceError::Encode { .. } => ErrorCategory::Encode,

            TraceError::Json(_) => ErrorCategory::Decode,

            TraceError::Push { .. } => ErrorCategory::Push,

            TraceError::NotRunning { .. } | TraceError::DrainTimeout { .. } => {
                ErrorCategory::Lifecycle
            }
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            TraceError::UnregisteredTable { .. } => "UNREGISTERED_TABLE",
            TraceError::InvalidConfig { .. } => "INVALID_CONFIG",
            TraceError::Io { .. } => "TABLE_IO_ERROR",
            TraceError::TableNotFound { .. } => "TABLE_NOT_FOUND",
            TraceError::Encode { .. } => "ENCODE_ERROR",
            TraceError::Push { .. } => "PUSH_ERROR",
            TraceError::NotRunning { .. } => "NOT_RUNNING",
            TraceError::DrainTimeout { .. } => "DRAIN_TIMEOUT",
            TraceError::Json(_) => "JSON_ERROR",
            TraceError::IoError { .. } => "IO_ERROR",
        }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        TraceError::IoError {
            message: err.to_string(),
        }
    }
}
