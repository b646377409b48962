//! Error types for pgmux

use thiserror::Error;

/// SQLSTATE raised when a serializable transaction loses a write conflict
pub const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE raised when a `NOWAIT` lock request cannot be granted
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Marker some backends put in the message when the client should retry
/// the transaction as serializable
pub const RETRY_SERIALIZABLE_MARKER: &str = "RETRY_SERIALIZABLE";

/// Core error type for pgmux operations
#[derive(Error, Debug)]
pub enum PgmuxError {
    /// Error reported by the backend, tagged with its SQLSTATE code
    #[error("Database error [{code}]: {message}")]
    Database { code: String, message: String },

    /// The physical connection was closed without an error
    #[error("Connection closed")]
    ConnectionClosed,

    /// Pending query aborted because its pool was torn down
    #[error("Connection destroyed: {0}")]
    ConnectionDestroyed(String),

    /// The pool has been drained and accepts no more work
    #[error("Connection ended")]
    ConnectionEnded,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A `ClientRef` was used after `close()`
    #[error("DB client is already closed")]
    LeaseClosed,

    /// A reserved executor was used after it went back to the pool
    #[error("Reserved connection has already been released")]
    ReservationReleased,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PgmuxError {
    /// Build a backend error from a SQLSTATE code and message
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE or symbolic driver code for this error, if it has one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => Some(code),
            Self::ConnectionClosed => Some("CONNECTION_CLOSED"),
            Self::ConnectionDestroyed(_) => Some("CONNECTION_DESTROYED"),
            Self::ConnectionEnded => Some("CONNECTION_ENDED"),
            _ => None,
        }
    }

    /// Whether repeating the same logical operation is expected to make progress.
    ///
    /// Serialization conflicts, lock-not-available, closed and destroyed
    /// connections, and errors whose message asks for a serializable retry are
    /// transient. `ConnectionEnded` is not: the pool is gone for good.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { code, message } => {
                code == SERIALIZATION_FAILURE
                    || code == LOCK_NOT_AVAILABLE
                    || message.contains(RETRY_SERIALIZABLE_MARKER)
            }
            Self::ConnectionClosed | Self::ConnectionDestroyed(_) => true,
            other => other.to_string().contains(RETRY_SERIALIZABLE_MARKER),
        }
    }
}

/// Result type alias for pgmux operations
pub type Result<T> = std::result::Result<T, PgmuxError>;
