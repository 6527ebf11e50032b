//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The row was not in the state the operation requires.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be mapped back to a domain type.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Core(#[from] relay_core::CoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
