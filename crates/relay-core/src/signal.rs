//! Broadcast trade signals.
//!
//! A `Signal` is immutable once created. Expiry is a property of its age
//! checked at delivery time; signals are never deleted.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::order::OrderSide;
use crate::symbol::to_exchange_coin;
use crate::Price;

/// Public signal identifier.
///
/// Format: `sig_{uuid_simple}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    /// Generate a fresh random signal id.
    pub fn generate() -> Self {
        Self(format!("sig_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SignalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    #[serde(rename = "BUY", alias = "LONG", alias = "buy", alias = "long")]
    Long,
    #[serde(rename = "SELL", alias = "SHORT", alias = "sell", alias = "short")]
    Short,
}

impl SignalAction {
    /// Entry side for this action.
    pub fn side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    pub fn from_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => Self::Long,
            OrderSide::Sell => Self::Short,
        }
    }

    /// Storage representation (`BUY`/`SELL`).
    pub fn as_str(&self) -> &'static str {
        self.side().as_str()
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal as submitted by the broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSignal {
    pub action: SignalAction,
    pub symbol: String,
    pub entry_price: Price,
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default, alias = "risk_pct")]
    pub risk_fraction: Option<Decimal>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub trend_strength: Option<Decimal>,
    #[serde(default)]
    pub volatility: Option<Decimal>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewSignal {
    /// Stamp the submission with an id and creation time.
    #[must_use]
    pub fn into_signal(self, id: SignalId, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id,
            action: self.action,
            symbol: self.symbol,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            leverage: self.leverage,
            risk_fraction: self.risk_fraction,
            timeframe: self.timeframe,
            trend_strength: self.trend_strength,
            volatility: self.volatility,
            notes: self.notes,
            created_at,
        }
    }
}

/// A broadcast signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub action: SignalAction,
    /// Signal symbol as broadcast (e.g. "ADA/USDT").
    pub symbol: String,
    pub entry_price: Price,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    /// Requested leverage; the executor falls back to its default when absent.
    pub leverage: Option<Decimal>,
    /// Fraction of equity risked between entry and stop (0.02 = 2%).
    pub risk_fraction: Option<Decimal>,
    pub timeframe: Option<String>,
    pub trend_strength: Option<Decimal>,
    pub volatility: Option<Decimal>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Exchange coin for the signal symbol.
    pub fn coin(&self) -> String {
        to_exchange_coin(&self.symbol)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// A signal is deliverable only while its age is strictly below the window.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.age(now) >= window
    }

    pub fn risk_fraction_or(&self, default: Decimal) -> Decimal {
        self.risk_fraction.unwrap_or(default)
    }

    pub fn leverage_or(&self, default: Decimal) -> Decimal {
        self.leverage.unwrap_or(default)
    }
}
