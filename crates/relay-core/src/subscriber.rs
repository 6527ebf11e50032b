//! Subscriber accounts.
//!
//! Credentials are opaque bytes here; decryption happens behind the
//! exchange crate's `CredentialStore`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscriber primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub i64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Running trade statistics for billing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub total_trades: i64,
    pub total_profit: Decimal,
    pub current_cycle_profit: Decimal,
    pub current_cycle_trades: i64,
}

impl SubscriberStats {
    /// Account for one closed, signal-matched trade.
    pub fn record_trade(&mut self, profit: Decimal) {
        self.total_trades += 1;
        self.total_profit += profit;
        self.current_cycle_trades += 1;
        self.current_cycle_profit += profit;
    }
}

/// A follower account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    /// Account API key; also the identity used in logs (shortened).
    pub api_key: String,
    pub email: Option<String>,
    /// Main account address queried for balances and positions.
    pub wallet_address: Option<String>,
    /// Encrypted exchange credentials (opaque).
    #[serde(skip_serializing, default)]
    pub encrypted_credentials: Option<Vec<u8>>,
    /// Agent switched on by the subscriber.
    pub active: bool,
    /// Billing gate.
    pub access_granted: bool,
    pub suspension_reason: Option<String>,
    pub pending_invoice_id: Option<String>,
    pub pending_invoice_amount: Decimal,
    pub invoice_due_date: Option<DateTime<Utc>>,
    pub billing_cycle_start: Option<DateTime<Utc>>,
    pub stats: SubscriberStats,
}

impl Subscriber {
    /// Minimal active subscriber, used for seeding and tests.
    pub fn new(id: SubscriberId, api_key: impl Into<String>) -> Self {
        Self {
            id,
            api_key: api_key.into(),
            email: None,
            wallet_address: None,
            encrypted_credentials: None,
            active: true,
            access_granted: true,
            suspension_reason: None,
            pending_invoice_id: None,
            pending_invoice_amount: Decimal::ZERO,
            invoice_due_date: None,
            billing_cycle_start: None,
            stats: SubscriberStats::default(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.encrypted_credentials
            .as_ref()
            .is_some_and(|blob| !blob.is_empty())
    }

    /// An outstanding invoice whose due date has passed blocks trading.
    pub fn invoice_overdue(&self, now: DateTime<Utc>) -> bool {
        match (&self.pending_invoice_id, self.invoice_due_date) {
            (Some(_), Some(due)) => due <= now,
            _ => false,
        }
    }

    /// Whether deliveries for this subscriber may be executed.
    pub fn can_trade(&self, now: DateTime<Utc>) -> bool {
        self.active && self.has_credentials() && self.access_granted && !self.invoice_overdue(now)
    }

    /// Shortened key for log lines.
    pub fn short_key(&self) -> String {
        shorten(&self.api_key, 15)
    }
}

fn shorten(key: &str, keep: usize) -> String {
    if key.chars().count() <= keep {
        return key.to_string();
    }
    let prefix: String = key.chars().take(keep).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn trader() -> Subscriber {
        let mut sub = Subscriber::new(SubscriberId(1), "rk_live_0123456789abcdef");
        sub.encrypted_credentials = Some(b"cipher".to_vec());
        sub
    }

    #[test]
    fn test_can_trade_requires_all_gates() {
        let now = Utc::now();
        assert!(trader().can_trade(now));

        let mut inactive = trader();
        inactive.active = false;
        assert!(!inactive.can_trade(now));

        let mut no_creds = trader();
        no_creds.encrypted_credentials = Some(Vec::new());
        assert!(!no_creds.can_trade(now));

        let mut blocked = trader();
        blocked.access_granted = false;
        assert!(!blocked.can_trade(now));
    }

    #[test]
    fn test_invoice_overdue_only_with_pending_invoice() {
        let now = Utc::now();
        let mut sub = trader();
        sub.invoice_due_date = Some(now - Duration::days(1));
        assert!(!sub.invoice_overdue(now));

        sub.pending_invoice_id = Some("inv_1".to_string());
        assert!(sub.invoice_overdue(now));
        assert!(!sub.can_trade(now));

        sub.invoice_due_date = Some(now + Duration::days(1));
        assert!(!sub.invoice_overdue(now));
    }

    #[test]
    fn test_record_trade_updates_all_counters() {
        let mut stats = SubscriberStats::default();
        stats.record_trade(dec!(20));
        stats.record_trade(dec!(-5.5));

        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.current_cycle_trades, 2);
        assert_eq!(stats.total_profit, dec!(14.5));
        assert_eq!(stats.current_cycle_profit, dec!(14.5));
    }

    #[test]
    fn test_short_key() {
        assert_eq!(trader().short_key(), "rk_live_0123456...");
        assert_eq!(Subscriber::new(SubscriberId(2), "short").short_key(), "short");
    }
}
