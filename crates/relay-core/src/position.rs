//! Open brackets and the closed-trade ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;
use crate::order::{OrderId, OrderSide};
use crate::signal::SignalId;
use crate::subscriber::SubscriberId;
use crate::{Price, Size};

/// Open position primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub i64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an open position row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Bracket live on the exchange.
    Open,
    /// Closed by TP/SL and written to the ledger.
    Closed,
    /// Closed, but not traceable to a signal; excluded from ledger and billing.
    ClosedManual,
    /// Closed, but the exit could not be priced; needs an operator.
    NeedsReview,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::ClosedManual => "closed_manual",
            Self::NeedsReview => "needs_review",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "closed_manual" => Ok(Self::ClosedManual),
            "needs_review" => Ok(Self::NeedsReview),
            "error" => Ok(Self::Error),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Position to persist once all three bracket legs are placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOpenPosition {
    pub subscriber_id: SubscriberId,
    pub signal_id: Option<SignalId>,
    pub entry_order_id: OrderId,
    pub tp_order_id: OrderId,
    pub sl_order_id: OrderId,
    /// Signal symbol ("ADA/USDT").
    pub symbol: String,
    /// Exchange coin ("ADA").
    pub coin: String,
    /// Entry side.
    pub side: OrderSide,
    pub quantity: Size,
    pub leverage: Decimal,
    pub entry_fill_price: Price,
    pub target_tp: Price,
    pub target_sl: Price,
    pub opened_at: DateTime<Utc>,
}

/// One live bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: PositionId,
    pub subscriber_id: SubscriberId,
    pub signal_id: Option<SignalId>,
    pub entry_order_id: OrderId,
    pub tp_order_id: OrderId,
    pub sl_order_id: OrderId,
    pub symbol: String,
    pub coin: String,
    pub side: OrderSide,
    pub quantity: Size,
    pub leverage: Decimal,
    pub entry_fill_price: Price,
    pub target_tp: Price,
    pub target_sl: Price,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
}

impl OpenPosition {
    #[must_use]
    pub fn from_new(id: PositionId, new: NewOpenPosition) -> Self {
        Self {
            id,
            subscriber_id: new.subscriber_id,
            signal_id: new.signal_id,
            entry_order_id: new.entry_order_id,
            tp_order_id: new.tp_order_id,
            sl_order_id: new.sl_order_id,
            symbol: new.symbol,
            coin: new.coin,
            side: new.side,
            quantity: new.quantity,
            leverage: new.leverage,
            entry_fill_price: new.entry_fill_price,
            target_tp: new.target_tp,
            target_sl: new.target_sl,
            opened_at: new.opened_at,
            status: PositionStatus::Open,
        }
    }

    /// Order id of the leg that did not fire for a given exit.
    pub fn remaining_leg(&self, exit: ExitType) -> Option<OrderId> {
        match exit {
            ExitType::Tp => Some(self.sl_order_id),
            ExitType::Sl => Some(self.tp_order_id),
            ExitType::Unknown => None,
        }
    }
}

/// Which leg closed the bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitType {
    Tp,
    Sl,
    Unknown,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tp => "TP",
            Self::Sl => "SL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ExitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP" => Ok(Self::Tp),
            "SL" => Ok(Self::Sl),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Origin of a trade's realized P&L figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlSource {
    /// Sum of exchange-reported closed P&L.
    Exchange,
    /// Locally computed price delta.
    Calculated,
}

impl PnlSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::Calculated => "calculated",
        }
    }
}

impl fmt::Display for PnlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry to write on close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrade {
    /// Public trade id (`trade_{token}`).
    pub trade_id: String,
    pub subscriber_id: SubscriberId,
    pub signal_id: Option<SignalId>,
    pub entry_order_id: Option<OrderId>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub symbol: String,
    /// Entry side of the round trip.
    pub side: OrderSide,
    pub entry_price: Price,
    pub exit_price: Price,
    pub quantity: Size,
    pub leverage: Decimal,
    pub profit_usd: Decimal,
    pub profit_percent: Decimal,
    pub exit_type: ExitType,
    pub pnl_source: PnlSource,
    pub fee_charged: Decimal,
    pub notes: Option<String>,
}

impl NewTrade {
    /// Generate a public trade id.
    pub fn generate_id() -> String {
        let token = Uuid::new_v4().simple().to_string();
        format!("trade_{}", &token[..16])
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    #[serde(flatten)]
    pub details: NewTrade,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.details.profit_usd > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_parse_and_terminal() {
        for status in [
            PositionStatus::Open,
            PositionStatus::Closed,
            PositionStatus::ClosedManual,
            PositionStatus::NeedsReview,
            PositionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<PositionStatus>().unwrap(), status);
        }
        assert!(!PositionStatus::Open.is_terminal());
        assert!(PositionStatus::ClosedManual.is_terminal());
    }

    #[test]
    fn test_remaining_leg() {
        let position = OpenPosition::from_new(
            PositionId(1),
            NewOpenPosition {
                subscriber_id: SubscriberId(7),
                signal_id: None,
                entry_order_id: OrderId(1),
                tp_order_id: OrderId(2),
                sl_order_id: OrderId(3),
                symbol: "ADA/USDT".to_string(),
                coin: "ADA".to_string(),
                side: OrderSide::Buy,
                quantity: Size::new(dec!(1000)),
                leverage: dec!(5),
                entry_fill_price: Price::new(dec!(0.5)),
                target_tp: Price::new(dec!(0.55)),
                target_sl: Price::new(dec!(0.48)),
                opened_at: Utc::now(),
            },
        );

        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.remaining_leg(ExitType::Tp), Some(OrderId(3)));
        assert_eq!(position.remaining_leg(ExitType::Sl), Some(OrderId(2)));
        assert_eq!(position.remaining_leg(ExitType::Unknown), None);
    }

    #[test]
    fn test_trade_id_format() {
        let id = NewTrade::generate_id();
        assert!(id.starts_with("trade_"));
        assert_eq!(id.len(), "trade_".len() + 16);
    }
}
