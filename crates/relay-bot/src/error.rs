//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] relay_store::StoreError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] relay_exchange::ExchangeError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] relay_telemetry::TelemetryError),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
