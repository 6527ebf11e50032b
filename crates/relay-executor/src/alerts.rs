//! Operator alert titles and detail formatting for bracket failures.

use relay_core::{OrderSide, Signal, Size};

pub const ENTRY_ORDER_FAILED: &str = "Entry Order Failed";
pub const BRACKET_INCOMPLETE: &str = "Bracket Order Incomplete";
pub const MANUAL_INTERVENTION: &str = "MANUAL INTERVENTION REQUIRED";
pub const POSITION_RECORD_FAILED: &str = "Position Record Failed";

/// "Failed to Cancel TP Order"
pub fn cancel_failed_title(label: &str) -> String {
    format!("Failed to Cancel {label} Order")
}

/// "TP order failed after all retries - Emergency close SUCCESSFUL"
pub fn bracket_incomplete_summary(leg_label: &str, emergency_closed: bool) -> String {
    let outcome = if emergency_closed {
        "SUCCESSFUL"
    } else {
        "FAILED"
    };
    format!("{leg_label} order failed after all retries - Emergency close {outcome}")
}

/// Common header lines identifying the account and trade.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub account: String,
    pub signal_id: String,
    pub coin: String,
    pub side: OrderSide,
    pub quantity: Option<Size>,
}

impl AlertContext {
    pub fn new(account: &str, signal: &Signal) -> Self {
        Self {
            account: account.to_string(),
            signal_id: signal.id.to_string(),
            coin: signal.coin(),
            side: signal.action.side(),
            quantity: None,
        }
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Size) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Header followed by `body`.
    pub fn details(&self, body: &str) -> String {
        let mut lines = vec![
            format!("Account: {}", self.account),
            format!("Signal: {}", self.signal_id),
            format!("Coin: {}", self.coin),
            format!("Side: {}", self.side.position_label()),
        ];
        if let Some(quantity) = self.quantity {
            lines.push(format!("Quantity: {quantity}"));
        }
        lines.push(String::new());
        lines.push(body.to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_titles() {
        assert_eq!(cancel_failed_title("TP"), "Failed to Cancel TP Order");
        assert_eq!(
            bracket_incomplete_summary("SL", false),
            "SL order failed after all retries - Emergency close FAILED"
        );
    }
}
