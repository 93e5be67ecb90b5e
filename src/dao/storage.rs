use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by the record store regardless of the operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    #[error("sqlite query failed")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize column payload")]
    Payload(#[from] serde_json::Error),
    #[error("corrupt row in `{table}`: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("database task panicked")]
    TaskPanicked,
    #[error("transaction rolled back: deadline exceeded")]
    DeadlineExceeded,
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the error is a uniqueness violation reported by SQLite, returning the
    /// constraint description (e.g. `turn_sheets.code`).
    pub fn unique_violation(&self) -> Option<&str> {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, Some(message)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                message.strip_prefix("UNIQUE constraint failed: ")
            }
            _ => None,
        }
    }
}
