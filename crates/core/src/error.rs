use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid column type: {0}")]
    InvalidColumnType(String),
}
