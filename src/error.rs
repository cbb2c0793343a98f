use thiserror::Error;

use crate::ports::{ProviderError, RepositoryError};
use crate::services::sync::SyncError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Process exit code reported by the binary for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_)
            | AppError::Validation(_)
            | AppError::Json(_)
            | AppError::Repository(RepositoryError::InvalidArgument(_)) => 2,
            AppError::NotFound(_) | AppError::Sync(SyncError::ConnectionNotFound(_)) => 3,
            AppError::Sync(SyncError::ConnectionNotLinked { .. }) => 4,
            _ => 1,
        }
    }
}
