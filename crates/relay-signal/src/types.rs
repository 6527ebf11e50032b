//! Response types of the signal protocol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use relay_core::{Delivery, Signal, SignalId, SubscriberStats, Trade};

/// Result of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReceipt {
    pub signal_id: SignalId,
    /// Number of subscribers a delivery was created for.
    pub delivered_to: usize,
    pub expires_in_minutes: i64,
    pub created_at: DateTime<Utc>,
}

/// Answer to a subscriber's poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LatestSignal {
    /// Billing gate closed.
    AccessDenied { reason: String, amount_due: Decimal },
    /// Nothing pending.
    None,
    /// The newest pending signal aged out; its delivery is now retired.
    Expired { age_minutes: i64 },
    Available {
        delivery: Delivery,
        signal: Signal,
        age_seconds: i64,
    },
}

impl LatestSignal {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

/// Outcome of `confirm_execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
}

/// Per-subscriber P&L summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total_trades: i64,
    pub total_profit: Decimal,
    pub current_cycle_profit: Decimal,
    pub current_cycle_trades: i64,
    pub billing_cycle_start: Option<DateTime<Utc>>,
    pub winning_trades: usize,
    pub losing_trades: usize,
}

impl LedgerSummary {
    pub(crate) fn new(
        stats: SubscriberStats,
        billing_cycle_start: Option<DateTime<Utc>>,
        trades: &[Trade],
    ) -> Self {
        let winning_trades = trades.iter().filter(|t| t.is_win()).count();
        let losing_trades = trades
            .iter()
            .filter(|t| t.details.profit_usd < Decimal::ZERO)
            .count();

        Self {
            total_trades: stats.total_trades,
            total_profit: stats.total_profit,
            current_cycle_profit: stats.current_cycle_profit,
            current_cycle_trades: stats.current_cycle_trades,
            billing_cycle_start,
            winning_trades,
            losing_trades,
        }
    }

    /// Share of winning trades among decided ones, in percent.
    pub fn win_rate(&self) -> Option<Decimal> {
        let decided = self.winning_trades + self.losing_trades;
        if decided == 0 {
            return None;
        }
        Some(Decimal::from(self.winning_trades) * Decimal::ONE_HUNDRED / Decimal::from(decided))
    }
}
