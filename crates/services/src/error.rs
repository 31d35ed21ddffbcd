use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] cohort_storage::StorageError),

    #[error("core error: {0}")]
    Core(#[from] cohort_core::CoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
