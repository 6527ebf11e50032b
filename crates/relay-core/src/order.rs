//! Order-related types and identifiers.
//!
//! Provides order side, time-in-force, order kind, and the exchange
//! order id used to track bracket legs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::Price;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    #[serde(alias = "buy", alias = "LONG", alias = "long")]
    Buy,
    #[serde(alias = "sell", alias = "SHORT", alias = "short")]
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }

    /// Storage/wire representation (`BUY`/`SELL`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Direction label of a position opened on this side.
    pub fn position_label(&self) -> &'static str {
        match self {
            Self::Buy => "LONG",
            Self::Sell => "SHORT",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Self::Buy),
            "SELL" | "SHORT" => Ok(Self::Sell),
            other => Err(CoreError::InvalidAction(other.to_string())),
        }
    }
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancelled.
    #[default]
    #[serde(rename = "Gtc")]
    GoodTilCancelled,
    /// Immediate-or-cancel (entry and emergency close).
    #[serde(rename = "Ioc")]
    ImmediateOrCancel,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoodTilCancelled => write!(f, "Gtc"),
            Self::ImmediateOrCancel => write!(f, "Ioc"),
        }
    }
}

/// Which protective leg a trigger order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpSl {
    Tp,
    Sl,
}

impl fmt::Display for TpSl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tp => write!(f, "tp"),
            Self::Sl => write!(f, "sl"),
        }
    }
}

/// Order kind as understood by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Plain limit order.
    Limit { tif: TimeInForce },
    /// Trigger order that activates when the mark crosses `trigger_px`.
    ///
    /// `is_market = true` executes as market once triggered (stop-loss);
    /// otherwise it rests as a limit at the order price (take-profit).
    Trigger {
        trigger_px: Price,
        is_market: bool,
        tpsl: TpSl,
    },
}

impl OrderKind {
    /// IOC limit order.
    pub fn ioc() -> Self {
        Self::Limit {
            tif: TimeInForce::ImmediateOrCancel,
        }
    }

    /// Take-profit trigger: limit execution at the target.
    pub fn take_profit(trigger_px: Price) -> Self {
        Self::Trigger {
            trigger_px,
            is_market: false,
            tpsl: TpSl::Tp,
        }
    }

    /// Stop-loss trigger: market execution once hit.
    pub fn stop_loss(trigger_px: Price) -> Self {
        Self::Trigger {
            trigger_px,
            is_market: true,
            tpsl: TpSl::Sl,
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }
}

/// Exchange-assigned order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl OrderId {
    #[inline]
    pub fn new(oid: u64) -> Self {
        Self(oid)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_order_side_sign() {
        assert_eq!(OrderSide::Buy.sign(), 1);
        assert_eq!(OrderSide::Sell.sign(), -1);
    }

    #[test]
    fn test_order_side_parses_long_short_aliases() {
        assert_eq!("long".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("SELL".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!("flat".parse::<OrderSide>().is_err());

        let side: OrderSide = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(side, OrderSide::Sell);
    }

    #[test]
    fn test_bracket_order_kinds() {
        let tp = OrderKind::take_profit(Price::new(dec!(0.55)));
        let sl = OrderKind::stop_loss(Price::new(dec!(0.48)));

        assert!(matches!(tp, OrderKind::Trigger { is_market: false, tpsl: TpSl::Tp, .. }));
        assert!(matches!(sl, OrderKind::Trigger { is_market: true, tpsl: TpSl::Sl, .. }));
        assert!(!OrderKind::ioc().is_trigger());
    }
}
