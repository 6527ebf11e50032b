//! Position monitor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),

    #[error(transparent)]
    Exchange(#[from] relay_exchange::ExchangeError),

    #[error(transparent)]
    Store(#[from] relay_store::StoreError),

    #[error(transparent)]
    Core(#[from] relay_core::CoreError),
}

pub type PositionResult<T> = Result<T, PositionError>;
