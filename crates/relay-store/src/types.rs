//! Store row bundles and the error log entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use relay_core::{Delivery, Signal, Subscriber};

/// One row of the trading loop's eligibility query.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelivery {
    pub delivery: Delivery,
    pub signal: Signal,
    pub subscriber: Subscriber,
}

/// A delivery joined with its signal.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryWithSignal {
    pub delivery: Delivery,
    pub signal: Signal,
}

// ============================================================================
// Error log
// ============================================================================

const ACCOUNT_MAX_CHARS: usize = 20;
const MESSAGE_MAX_CHARS: usize = 1000;
const CONTEXT_MAX_CHARS: usize = 2000;

/// Category of a persisted per-subscriber failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    CredentialsNotFound,
    SafetyCheckError,
    EntryOrderFailed,
    EmergencyClose,
    TradeExecutionError,
    SignalProcessingError,
    TradingLoopError,
    PositionMonitorLoopError,
    PositionRecordFailed,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialsNotFound => "CREDENTIALS_NOT_FOUND",
            Self::SafetyCheckError => "SAFETY_CHECK_ERROR",
            Self::EntryOrderFailed => "ENTRY_ORDER_FAILED",
            Self::EmergencyClose => "EMERGENCY_CLOSE",
            Self::TradeExecutionError => "TRADE_EXECUTION_ERROR",
            Self::SignalProcessingError => "SIGNAL_PROCESSING_ERROR",
            Self::TradingLoopError => "TRADING_LOOP_ERROR",
            Self::PositionMonitorLoopError => "POSITION_MONITOR_LOOP_ERROR",
            Self::PositionRecordFailed => "POSITION_RECORD_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::CredentialsNotFound,
            Self::SafetyCheckError,
            Self::EntryOrderFailed,
            Self::EmergencyClose,
            Self::TradeExecutionError,
            Self::SignalProcessingError,
            Self::TradingLoopError,
            Self::PositionMonitorLoopError,
            Self::PositionRecordFailed,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted failure record. Fields are truncated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub account: String,
    pub error_type: ErrorType,
    pub message: String,
    /// Serialized JSON context.
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(account: &str, error_type: ErrorType, message: impl AsRef<str>) -> Self {
        Self {
            account: truncate_with_ellipsis(account, ACCOUNT_MAX_CHARS),
            error_type,
            message: truncate(message.as_ref(), MESSAGE_MAX_CHARS),
            context: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(truncate(&context.to_string(), CONTEXT_MAX_CHARS));
        self
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", truncate(s, max_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_truncation() {
        let long_key = "k".repeat(40);
        let entry = ErrorLogEntry::new(&long_key, ErrorType::EmergencyClose, "x".repeat(1500))
            .with_context(serde_json::json!({ "blob": "y".repeat(3000) }));

        assert_eq!(entry.account, format!("{}...", "k".repeat(20)));
        assert_eq!(entry.message.len(), 1000);
        assert_eq!(entry.context.as_deref().map(str::len), Some(2000));
    }

    #[test]
    fn test_short_account_is_kept() {
        let entry = ErrorLogEntry::new("rk_short", ErrorType::TradingLoopError, "boom");
        assert_eq!(entry.account, "rk_short");
        assert_eq!(entry.context, None);
    }

    #[test]
    fn test_error_type_names() {
        assert_eq!(ErrorType::CredentialsNotFound.as_str(), "CREDENTIALS_NOT_FOUND");
        assert_eq!(
            ErrorType::parse("POSITION_MONITOR_LOOP_ERROR"),
            Some(ErrorType::PositionMonitorLoopError)
        );
        assert_eq!(ErrorType::parse("nope"), None);
    }
}
