//! Exchange error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The exchange answered and refused the request.
    #[error("Exchange rejected request: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to parse exchange response: {0}")]
    Parse(String),

    #[error("Credential error: {0}")]
    Credentials(String),
}

impl ExchangeError {
    /// The target order no longer exists ("not found", "already filled/canceled").
    ///
    /// Cancelling such an order is treated as success.
    #[must_use]
    pub fn is_already_gone(&self) -> bool {
        let message = self.to_string().to_ascii_lowercase();
        message.contains("not found") || message.contains("already")
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_gone_detection() {
        assert!(ExchangeError::Rejected("Order not found".into()).is_already_gone());
        assert!(
            ExchangeError::Rejected("Order was never placed, already canceled, or filled".into())
                .is_already_gone()
        );
        assert!(!ExchangeError::Rejected("Insufficient margin".into()).is_already_gone());
        assert!(!ExchangeError::Timeout.is_already_gone());
    }
}
