//! Executor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Signal data cannot produce a protected position.
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Position sizing failed: {0}")]
    Sizing(String),

    #[error(transparent)]
    Exchange(#[from] relay_exchange::ExchangeError),

    #[error(transparent)]
    Store(#[from] relay_store::StoreError),

    #[error(transparent)]
    Core(#[from] relay_core::CoreError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
