use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("core error: {0}")]
    Core(#[from] cohort_core::CoreError),

    #[error("validation failed for column {column}: {reason}")]
    Validation { column: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn validation(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            column: column.into(),
            reason: reason.into(),
        }
    }
}
