//! Error types for Tessera services

use std::fmt;

/// Result type alias using TesseraError
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Main error type for the gateway and its clients.
///
/// Every variant is recoverable at the handler or protocol layer: it turns into a
/// `CommandResult` of kind `Error` and never terminates the listener.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    /// Connection descriptor missing required keys or carrying unknown ones
    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Unknown login or bad password
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Login is neither admin nor granted the database
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Database name not present in the catalog
    #[error("Database '{0}' does not exist")]
    DatabaseNotFound(String),

    /// Resource already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Resource (login, grant) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Command text does not match the handler's grammar
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Backing engine failure, surfaced verbatim
    #[error("{0}")]
    Execution(String),

    /// Request or response frame larger than the configured maximum
    #[error("Message size {size} exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Read, write or execution deadline elapsed
    #[error("Timed out during {phase} after {secs}s")]
    Timeout { phase: &'static str, secs: u64 },

    /// Cursor id unknown to the cursor engine
    #[error("Cursor '{0}' not found")]
    CursorNotFound(String),

    /// Cursor was closed while the caller held a reference to it
    #[error("Cursor '{0}' is closed")]
    CursorClosed(String),

    /// Shutdown or caller cancellation
    #[error("Operation was cancelled")]
    Cancelled,

    /// Document (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Socket or file I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        TesseraError::Internal(err.to_string())
    }

    /// Wrap a backing-engine error message
    pub fn execution<E: fmt::Display>(err: E) -> Self {
        TesseraError::Execution(err.to_string())
    }

    /// Get the stable error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            TesseraError::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            TesseraError::AuthenticationFailed(_) => "UNAUTHENTICATED",
            TesseraError::AuthorizationDenied(_) => "PERMISSION_DENIED",
            TesseraError::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
            TesseraError::AlreadyExists(_) => "ALREADY_EXISTS",
            TesseraError::NotFound(_) => "NOT_FOUND",
            TesseraError::InvalidCommand(_) => "INVALID_COMMAND",
            TesseraError::Execution(_) => "EXECUTION_FAILED",
            TesseraError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            TesseraError::Timeout { .. } => "DEADLINE_EXCEEDED",
            TesseraError::CursorNotFound(_) => "CURSOR_NOT_FOUND",
            TesseraError::CursorClosed(_) => "CURSOR_CLOSED",
            TesseraError::Cancelled => "CANCELLED",
            TesseraError::Serialization(_) => "SERIALIZATION_ERROR",
            TesseraError::Io(_) => "IO_ERROR",
            TesseraError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the error was caused by the client rather than the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TesseraError::InvalidDescriptor(_)
                | TesseraError::AuthenticationFailed(_)
                | TesseraError::AuthorizationDenied(_)
                | TesseraError::DatabaseNotFound(_)
                | TesseraError::AlreadyExists(_)
                | TesseraError::NotFound(_)
                | TesseraError::InvalidCommand(_)
                | TesseraError::MessageTooLarge { .. }
                | TesseraError::CursorNotFound(_)
                | TesseraError::CursorClosed(_)
        )
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}
