//! Error classification for logging and metrics
//!
//! Engine errors are returned to clients verbatim; this module only decides
//! which bucket a failure is counted under.

use std::fmt;
use tessera_common::TesseraError;

/// Error category for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// SQL the engine could not parse
    Syntax,
    /// Constraint violations (unique, foreign key, check, not null)
    Constraint,
    /// Missing table, column, function, database, login or cursor
    NotFound,
    /// Database locked or busy
    Busy,
    /// Read, write, execution or lock deadline elapsed
    Timeout,
    /// Authentication/authorization errors
    Auth,
    /// Disk full, I/O failures, size limits
    Resource,
    /// Malformed descriptor, document or command text
    Protocol,
    /// Shutdown or caller cancellation
    Cancelled,
    /// Internal/unknown errors
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Constraint => "constraint",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Classify a gateway error
pub fn classify(err: &TesseraError) -> ErrorCategory {
    match err {
        TesseraError::Execution(raw) => classify_engine_message(raw),
        TesseraError::AuthenticationFailed(_) | TesseraError::AuthorizationDenied(_) => ErrorCategory::Auth,
        TesseraError::DatabaseNotFound(_)
        | TesseraError::NotFound(_)
        | TesseraError::CursorNotFound(_)
        | TesseraError::CursorClosed(_) => ErrorCategory::NotFound,
        TesseraError::AlreadyExists(_) => ErrorCategory::Constraint,
        TesseraError::InvalidDescriptor(_)
        | TesseraError::InvalidCommand(_)
        | TesseraError::Serialization(_) => ErrorCategory::Protocol,
        TesseraError::MessageTooLarge { .. } | TesseraError::Io(_) => ErrorCategory::Resource,
        TesseraError::Timeout { .. } => ErrorCategory::Timeout,
        TesseraError::Cancelled => ErrorCategory::Cancelled,
        TesseraError::Internal(_) => ErrorCategory::Internal,
    }
}

/// Classify raw engine error text
pub fn classify_engine_message(raw: &str) -> ErrorCategory {
    let lower = raw.to_lowercase();

    if lower.contains("syntax error") || lower.contains("incomplete input") {
        return ErrorCategory::Syntax;
    }
    if lower.contains("constraint failed") || lower.contains("constraint violation") {
        return ErrorCategory::Constraint;
    }
    if lower.contains("no such table")
        || lower.contains("no such column")
        || lower.contains("no such function")
        || lower.contains("no such index")
    {
        return ErrorCategory::NotFound;
    }
    if lower.contains("database is locked") || lower.contains("busy") {
        return ErrorCategory::Busy;
    }
    if lower.contains("interrupted") {
        return ErrorCategory::Timeout;
    }
    if lower.contains("disk i/o error")
        || lower.contains("database or disk is full")
        || lower.contains("out of memory")
    {
        return ErrorCategory::Resource;
    }
    if lower.contains("not read-only") || lower.contains("readonly") || lower.contains("read-only") {
        return ErrorCategory::Protocol;
    }
    ErrorCategory::Internal
}
