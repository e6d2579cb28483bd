//! Unified error types for tiercache.
//!
//! Every storage failure is classified into an [`ErrorKind`] so the retry
//! layer and the facade can decide whether to retry, recover the schema, or
//! degrade to a cache miss.

use rusqlite::ErrorCode;

/// Unified error type for the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a malformed table name).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(#[from] rusqlite::Error),

    /// An owned table is still missing after reinitializing the schema.
    #[error("SCHEMA_MISSING: no such table: {0}")]
    SchemaMissing(String),

    /// Payload could not be encoded or decoded as JSON.
    #[error("SERIALIZATION_FAILED: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem-level failure (permissions, disk full, missing directory).
    #[error("STORAGE_UNAVAILABLE: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by [`crate::cache::RetryPolicy`] and the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lock contention from another connection; retrying may succeed.
    TransientContention,
    /// A known table is gone; recoverable by re-running schema initialization.
    SchemaMissing,
    /// Payload encoding failed; the write is skipped.
    Serialization,
    /// Disk, permission, or open failures.
    StorageUnavailable,
    /// Anything else; surfaced without retry.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Database(err) => classify_sqlite(err),
            Error::SchemaMissing(_) => ErrorKind::SchemaMissing,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Io(_) => ErrorKind::StorageUnavailable,
            Error::InvalidInput(_) => ErrorKind::Other,
        }
    }

    /// True for "database is locked" / "database is busy" style failures.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientContention
    }

    /// Name of the missing table when this is a "no such table" failure.
    pub fn missing_table(&self) -> Option<&str> {
        let message = match self {
            Error::Database(rusqlite::Error::SqliteFailure(_, Some(msg))) => msg.as_str(),
            Error::SchemaMissing(table) => return Some(table.as_str()),
            _ => return None,
        };
        message
            .split_once("no such table:")
            .map(|(_, rest)| rest.trim().trim_start_matches("main."))
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> ErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(ffi, msg) => match ffi.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::TransientContention,
            ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase => ErrorKind::StorageUnavailable,
            _ => match msg.as_deref() {
                Some(m) if m.contains("no such table") => ErrorKind::SchemaMissing,
                Some(m) if is_lock_message(m) => ErrorKind::TransientContention,
                _ => ErrorKind::Other,
            },
        },
        rusqlite::Error::ToSqlConversionFailure(_) | rusqlite::Error::FromSqlConversionFailure(..) => {
            ErrorKind::Serialization
        }
        other => {
            let msg = other.to_string();
            if msg.contains("no such table") {
                ErrorKind::SchemaMissing
            } else if is_lock_message(&msg) {
                ErrorKind::TransientContention
            } else {
                ErrorKind::Other
            }
        }
    }
}

fn is_lock_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy") || msg.contains("database table is locked")
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io(err.error)
    }
}
