//! Error types for relay-core.

use thiserror::Error;

use crate::delivery::DeliveryStateKind;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid signal action: {0}")]
    InvalidAction(String),

    #[error("Invalid position status: {0}")]
    InvalidStatus(String),

    #[error("Invalid delivery transition: {action} from {from}")]
    InvalidTransition {
        from: DeliveryStateKind,
        action: &'static str,
    },

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
