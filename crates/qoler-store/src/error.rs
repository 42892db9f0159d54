use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("constraint violated: {0}")]
    Conflict(String),

    #[error("password hashing failed: {0}")]
    Password(String),

    #[error("storage is closed")]
    Closed,

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Route constraint failures to [`StoreError::Conflict`], everything
    /// else to [`StoreError::Sqlite`].
    pub(crate) fn classify(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::Conflict(err.to_string()),
            _ => Self::Sqlite(err),
        }
    }
}
