//! Exit classification.
//!
//! Decides which bracket leg closed a position. The default compares the
//! observed exit price to both targets; an order-presence policy trusts
//! whichever protective order vanished from the book.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use relay_core::{ExitType, OpenPosition, Price};

/// What the monitor observed when the position disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseEvidence {
    pub exit_price: Price,
    /// Whether the TP order is still resting. `None` when open orders could
    /// not be queried.
    pub tp_resting: Option<bool>,
    pub sl_resting: Option<bool>,
}

/// Exit classification policy.
pub trait ExitClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, position: &OpenPosition, evidence: &CloseEvidence) -> ExitType;
}

pub type DynExitClassifier = Arc<dyn ExitClassifier>;

/// Closer target wins; a tie counts as SL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriceProximity;

impl ExitClassifier for PriceProximity {
    fn name(&self) -> &'static str {
        "price_proximity"
    }

    fn classify(&self, position: &OpenPosition, evidence: &CloseEvidence) -> ExitType {
        let to_tp = evidence.exit_price.distance(position.target_tp);
        let to_sl = evidence.exit_price.distance(position.target_sl);
        if to_tp < to_sl {
            ExitType::Tp
        } else {
            ExitType::Sl
        }
    }
}

/// The leg whose order is gone fired. Falls back to price proximity when
/// order state is unknown or inconclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderPresence;

impl ExitClassifier for OrderPresence {
    fn name(&self) -> &'static str {
        "order_presence"
    }

    fn classify(&self, position: &OpenPosition, evidence: &CloseEvidence) -> ExitType {
        match (evidence.tp_resting, evidence.sl_resting) {
            (Some(false), Some(true)) => ExitType::Tp,
            (Some(true), Some(false)) => ExitType::Sl,
            _ => PriceProximity.classify(position, evidence),
        }
    }
}

/// Configurable classifier selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    #[default]
    PriceProximity,
    OrderPresence,
}

impl ClassifierKind {
    #[must_use]
    pub fn build(self) -> DynExitClassifier {
        match self {
            Self::PriceProximity => Arc::new(PriceProximity),
            Self::OrderPresence => Arc::new(OrderPresence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::{NewOpenPosition, OrderId, OrderSide, PositionId, Size, SubscriberId};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn position() -> OpenPosition {
        OpenPosition::from_new(
            PositionId(1),
            NewOpenPosition {
                subscriber_id: SubscriberId(1),
                signal_id: None,
                entry_order_id: OrderId(1),
                tp_order_id: OrderId(2),
                sl_order_id: OrderId(3),
                symbol: "ADA/USDT".to_string(),
                coin: "ADA".to_string(),
                side: OrderSide::Buy,
                quantity: Size::new(dec!(1000)),
                leverage: dec!(5),
                entry_fill_price: Price::new(dec!(0.50)),
                target_tp: Price::new(dec!(0.55)),
                target_sl: Price::new(dec!(0.48)),
                opened_at: Utc::now(),
            },
        )
    }

    fn evidence(px: Decimal, tp: Option<bool>, sl: Option<bool>) -> CloseEvidence {
        CloseEvidence {
            exit_price: Price::new(px),
            tp_resting: tp,
            sl_resting: sl,
        }
    }

    #[test]
    fn test_proximity_picks_closer_target() {
        let p = position();
        assert_eq!(PriceProximity.classify(&p, &evidence(dec!(0.549), None, None)), ExitType::Tp);
        assert_eq!(PriceProximity.classify(&p, &evidence(dec!(0.479), None, None)), ExitType::Sl);
        // Slipped well past the stop is still SL.
        assert_eq!(PriceProximity.classify(&p, &evidence(dec!(0.40), None, None)), ExitType::Sl);
    }

    #[test]
    fn test_order_presence_trusts_the_book() {
        let p = position();
        // Price says SL, book says TP fired.
        assert_eq!(
            OrderPresence.classify(&p, &evidence(dec!(0.49), Some(false), Some(true))),
            ExitType::Tp
        );
        assert_eq!(
            OrderPresence.classify(&p, &evidence(dec!(0.54), Some(true), Some(false))),
            ExitType::Sl
        );
        // Both gone: fall back to price.
        assert_eq!(
            OrderPresence.classify(&p, &evidence(dec!(0.54), Some(false), Some(false))),
            ExitType::Tp
        );
        assert_eq!(
            OrderPresence.classify(&p, &evidence(dec!(0.49), None, None)),
            ExitType::Sl
        );
    }

    #[test]
    fn test_kind_builds_named_policy() {
        assert_eq!(ClassifierKind::default().build().name(), "price_proximity");
        assert_eq!(ClassifierKind::OrderPresence.build().name(), "order_presence");
    }
}
