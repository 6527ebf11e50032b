//! Signal protocol error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// The delivery changed state between read and update.
    #[error("Delivery {0} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] relay_store::StoreError),

    #[error(transparent)]
    Core(#[from] relay_core::CoreError),
}

pub type SignalResult<T> = Result<T, SignalError>;
