//! Signal validation and risk-based position sizing.
//!
//! Quantity is derived from the risked equity and the stop distance only.
//! Leverage affects the margin the exchange reserves, never the quantity.

use rust_decimal::Decimal;
use std::fmt;

use relay_core::{Price, Signal, Size};

use crate::error::{ExecutorError, ExecutorResult};

// ============================================================================
// Validation
// ============================================================================

/// Protective prices of a validated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketTargets {
    pub stop_loss: Price,
    pub take_profit: Price,
}

/// Why a signal cannot be traded. Detected before any order is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRejection {
    MissingFields(Vec<&'static str>),
    InvalidValues(String),
}

impl SignalRejection {
    /// Alert title.
    pub fn title(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "Signal missing fields",
            Self::InvalidValues(_) => "Signal has invalid values",
        }
    }
}

impl fmt::Display for SignalRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFields(fields) => write!(f, "missing {}", fields.join(", ")),
            Self::InvalidValues(detail) => f.write_str(detail),
        }
    }
}

/// Check that the signal carries positive stop and target prices and a
/// non-zero stop distance.
pub fn validate_signal(signal: &Signal) -> Result<BracketTargets, SignalRejection> {
    let (stop_loss, take_profit) = match (signal.stop_loss, signal.take_profit) {
        (Some(sl), Some(tp)) => (sl, tp),
        (sl, tp) => {
            let mut missing = Vec::new();
            if sl.is_none() {
                missing.push("stop_loss");
            }
            if tp.is_none() {
                missing.push("take_profit");
            }
            return Err(SignalRejection::MissingFields(missing));
        }
    };

    if !stop_loss.is_positive() || !take_profit.is_positive() {
        return Err(SignalRejection::InvalidValues(format!(
            "stop_loss={stop_loss} take_profit={take_profit} must be positive"
        )));
    }
    if signal.entry_price.distance(stop_loss).is_zero() {
        return Err(SignalRejection::InvalidValues(format!(
            "zero stop distance: entry={} stop_loss={stop_loss}",
            signal.entry_price
        )));
    }

    Ok(BracketTargets {
        stop_loss,
        take_profit,
    })
}

// ============================================================================
// Sizing
// ============================================================================

/// Result of risk-based sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSize {
    /// equity × risk fraction
    pub risk_amount: Decimal,
    /// |entry − stop|
    pub risk_per_unit: Decimal,
    /// Floored to the instrument's size decimals.
    pub quantity: Size,
}

/// `quantity = equity × risk_fraction / |entry − stop|`, floored to
/// `sz_decimals`.
///
/// # Errors
/// `InvalidSignal` for a non-positive stop distance, `Sizing` for missing
/// equity, a quantity that overflows, or one that rounds to zero.
pub fn size_position(
    equity: Decimal,
    risk_fraction: Decimal,
    entry: Price,
    stop_loss: Price,
    sz_decimals: u32,
) -> ExecutorResult<PositionSize> {
    let risk_per_unit = entry.distance(stop_loss);
    if risk_per_unit <= Decimal::ZERO {
        return Err(ExecutorError::InvalidSignal(
            "risk per unit must be positive".to_string(),
        ));
    }
    if equity <= Decimal::ZERO {
        return Err(ExecutorError::Sizing(format!("no equity available ({equity})")));
    }
    if risk_fraction <= Decimal::ZERO {
        return Err(ExecutorError::Sizing(format!(
            "risk fraction must be positive ({risk_fraction})"
        )));
    }

    let risk_amount = equity
        .checked_mul(risk_fraction)
        .ok_or_else(|| ExecutorError::Sizing(format!("risk amount overflow ({equity} * {risk_fraction})")))?;
    let raw = risk_amount
        .checked_div(risk_per_unit)
        .ok_or_else(|| ExecutorError::Sizing(format!("quantity overflow (risk {risk_amount} / {risk_per_unit})")))?;
    let quantity = Size::new(raw).floor_to_decimals(sz_decimals);
    if !quantity.is_positive() {
        return Err(ExecutorError::Sizing(format!(
            "quantity rounds to zero (risk {risk_amount} / {risk_per_unit})"
        )));
    }

    Ok(PositionSize {
        risk_amount,
        risk_per_unit,
        quantity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::{NewSignal, SignalAction, SignalId};
    use rust_decimal_macros::dec;

    fn signal(sl: Option<Decimal>, tp: Option<Decimal>) -> Signal {
        NewSignal {
            action: SignalAction::Long,
            symbol: "ADA".to_string(),
            entry_price: Price::new(dec!(0.50)),
            stop_loss: sl.map(Price::new),
            take_profit: tp.map(Price::new),
            leverage: Some(dec!(5)),
            risk_fraction: Some(dec!(0.02)),
            timeframe: None,
            trend_strength: None,
            volatility: None,
            notes: None,
        }
        .into_signal(SignalId::generate(), Utc::now())
    }

    #[test]
    fn test_reference_scenario() {
        let size = size_position(
            dec!(1000),
            dec!(0.02),
            Price::new(dec!(0.50)),
            Price::new(dec!(0.48)),
            0,
        )
        .unwrap();
        assert_eq!(size.risk_amount, dec!(20));
        assert_eq!(size.risk_per_unit, dec!(0.02));
        assert_eq!(size.quantity.inner(), dec!(1000));
    }

    #[test]
    fn test_tiny_stop_distance_is_a_sizing_error() {
        let result = size_position(
            dec!(1000),
            dec!(0.02),
            Price::new(dec!(0.5)),
            Price::new(dec!(0.4999999999999999999999999999)),
            2,
        );
        assert!(matches!(result, Err(ExecutorError::Sizing(ref m)) if m.contains("quantity overflow")));
    }

    #[test]
    fn test_risked_amount_matches_fraction() {
        for equity in [dec!(250), dec!(1000), dec!(12345.67)] {
            let size = size_position(
                equity,
                dec!(0.02),
                Price::new(dec!(2.10)),
                Price::new(dec!(2.00)),
                4,
            )
            .unwrap();
            let risked = size.quantity.inner() * size.risk_per_unit;
            assert!((risked - equity * dec!(0.02)).abs() < dec!(0.001));
        }
    }

    #[test]
    fn test_quantity_is_floored() {
        let size = size_position(
            dec!(1000),
            dec!(0.02),
            Price::new(dec!(0.50)),
            Price::new(dec!(0.47)),
            2,
        )
        .unwrap();
        // 20 / 0.03 = 666.666...
        assert_eq!(size.quantity.inner(), dec!(666.66));
    }

    #[test]
    fn test_sizing_rejections() {
        let entry = Price::new(dec!(0.50));
        assert!(matches!(
            size_position(dec!(1000), dec!(0.02), entry, entry, 2),
            Err(ExecutorError::InvalidSignal(_))
        ));
        assert!(matches!(
            size_position(dec!(0), dec!(0.02), entry, Price::new(dec!(0.48)), 2),
            Err(ExecutorError::Sizing(_))
        ));
        // $0.01 of risk on a $100 stop distance floors to zero units.
        assert!(matches!(
            size_position(dec!(1), dec!(0.01), Price::new(dec!(200)), Price::new(dec!(100)), 0),
            Err(ExecutorError::Sizing(_))
        ));
    }

    #[test]
    fn test_validate_signal() {
        let targets = validate_signal(&signal(Some(dec!(0.48)), Some(dec!(0.55)))).unwrap();
        assert_eq!(targets.stop_loss.inner(), dec!(0.48));

        let missing = validate_signal(&signal(None, Some(dec!(0.55)))).unwrap_err();
        assert_eq!(missing, SignalRejection::MissingFields(vec!["stop_loss"]));
        assert_eq!(missing.title(), "Signal missing fields");

        let invalid = validate_signal(&signal(Some(dec!(0)), Some(dec!(0.55)))).unwrap_err();
        assert_eq!(invalid.title(), "Signal has invalid values");

        let flat = validate_signal(&signal(Some(dec!(0.50)), Some(dec!(0.55)))).unwrap_err();
        assert!(flat.to_string().contains("zero stop distance"));
    }
}
