//! Realized P&L resolution.
//!
//! Exchange-reported realized P&L is preferred; the locally computed
//! price-delta P&L is the fallback when the exchange reports nothing
//! meaningful.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use relay_core::{Fill, OrderSide, PnlSource, Price, Size};

/// Aggregate of the exchange fills on one coin since a position opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangePnl {
    /// Sum of `closed_pnl`.
    pub realized: Decimal,
    /// Size-weighted average fill price.
    pub avg_price: Option<Price>,
    pub fill_count: usize,
    pub total_quantity: Decimal,
}

/// Sum the realized P&L of `coin` fills at or after `since`.
///
/// `None` when no fill matches or the sums overflow. An average price that
/// overflows is left unset.
pub fn exchange_pnl(fills: &[Fill], coin: &str, since: DateTime<Utc>) -> Option<ExchangePnl> {
    let since_ms = since.timestamp_millis();
    let mut pnl = ExchangePnl {
        realized: Decimal::ZERO,
        avg_price: None,
        fill_count: 0,
        total_quantity: Decimal::ZERO,
    };
    let mut weighted = Some(Decimal::ZERO);

    for fill in fills
        .iter()
        .filter(|f| f.coin == coin && f.time_ms >= since_ms)
    {
        pnl.realized = pnl.realized.checked_add(fill.closed_pnl)?;
        pnl.total_quantity = pnl.total_quantity.checked_add(fill.sz.inner())?;
        weighted = weighted.and_then(|w| {
            fill.sz
                .inner()
                .checked_mul(fill.px.inner())
                .and_then(|notional| w.checked_add(notional))
        });
        pnl.fill_count += 1;
    }

    if pnl.fill_count == 0 {
        return None;
    }
    if pnl.total_quantity > Decimal::ZERO {
        pnl.avg_price = weighted
            .and_then(|w| w.checked_div(pnl.total_quantity))
            .map(Price::new);
    }
    Some(pnl)
}

/// Price of the most recent `coin` fill.
pub fn last_exit_price(fills: &[Fill], coin: &str) -> Option<Price> {
    fills
        .iter()
        .filter(|f| f.coin == coin)
        .max_by_key(|f| f.time_ms)
        .map(|f| f.px)
}

/// `(exit − entry) × quantity`, sign-flipped for shorts. `None` on overflow.
pub fn calculated_pnl(side: OrderSide, entry: Price, exit: Price, quantity: Size) -> Option<Decimal> {
    let delta = exit.inner().checked_sub(entry.inner())?;
    let signed = match side {
        OrderSide::Buy => delta,
        OrderSide::Sell => -delta,
    };
    signed.checked_mul(quantity.inner())
}

/// Price move in percent, from the position's point of view. Zero when
/// the entry is not positive or the ratio overflows.
pub fn profit_percent(side: OrderSide, entry: Price, exit: Price) -> Decimal {
    if !entry.is_positive() {
        return Decimal::ZERO;
    }
    let pct = exit
        .inner()
        .checked_sub(entry.inner())
        .and_then(|delta| delta.checked_div(entry.inner()))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO);
    match side {
        OrderSide::Buy => pct,
        OrderSide::Sell => -pct,
    }
}

/// Thresholds for choosing between exchange and calculated P&L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlPolicy {
    /// Exchange P&L at or below this magnitude is treated as absent.
    pub min_abs: Decimal,
    /// Divergence between the two sources above this is logged.
    pub divergence_warn: Decimal,
}

impl Default for PnlPolicy {
    fn default() -> Self {
        Self {
            min_abs: Decimal::new(1, 2),
            divergence_warn: Decimal::new(50, 2),
        }
    }
}

/// Chosen P&L and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPnl {
    pub profit_usd: Decimal,
    pub source: PnlSource,
    pub calculated: Decimal,
}

impl PnlPolicy {
    pub fn resolve(&self, exchange: Option<Decimal>, calculated: Decimal) -> ResolvedPnl {
        match exchange {
            Some(realized) if realized.abs() > self.min_abs => {
                let divergence = (realized - calculated).abs();
                if divergence > self.divergence_warn {
                    info!(
                        exchange = %realized,
                        calculated = %calculated,
                        %divergence,
                        "Exchange P&L diverges from price-delta P&L"
                    );
                }
                ResolvedPnl {
                    profit_usd: realized,
                    source: PnlSource::Exchange,
                    calculated,
                }
            }
            _ => ResolvedPnl {
                profit_usd: calculated,
                source: PnlSource::Calculated,
                calculated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_core::OrderId;
    use rust_decimal_macros::dec;

    fn fill(coin: &str, px: Decimal, sz: Decimal, at: DateTime<Utc>, pnl: Decimal) -> Fill {
        Fill {
            coin: coin.to_string(),
            px: Price::new(px),
            sz: Size::new(sz),
            side: OrderSide::Sell,
            time_ms: at.timestamp_millis(),
            oid: Some(OrderId(1)),
            tid: None,
            closed_pnl: pnl,
        }
    }

    #[test]
    fn test_exchange_pnl_filters_coin_and_time() {
        let opened = Utc::now();
        let fills = vec![
            fill("ADA", dec!(0.50), dec!(1000), opened - Duration::minutes(5), dec!(3)),
            fill("ADA", dec!(0.55), dec!(600), opened + Duration::minutes(1), dec!(30)),
            fill("ADA", dec!(0.56), dec!(400), opened + Duration::minutes(2), dec!(24)),
            fill("BTC", dec!(60000), dec!(1), opened + Duration::minutes(3), dec!(99)),
        ];

        let pnl = exchange_pnl(&fills, "ADA", opened).unwrap();
        assert_eq!(pnl.realized, dec!(54));
        assert_eq!(pnl.fill_count, 2);
        assert_eq!(pnl.total_quantity, dec!(1000));
        assert_eq!(pnl.avg_price.unwrap().inner(), dec!(0.554));
        assert!(exchange_pnl(&fills, "ETH", opened).is_none());
    }

    #[test]
    fn test_last_exit_price_is_most_recent() {
        let now = Utc::now();
        let fills = vec![
            fill("ADA", dec!(0.55), dec!(1), now, dec!(0)),
            fill("ADA", dec!(0.50), dec!(1), now - Duration::minutes(10), dec!(0)),
        ];
        assert_eq!(last_exit_price(&fills, "ADA").unwrap().inner(), dec!(0.55));
        assert!(last_exit_price(&fills, "SOL").is_none());
    }

    #[test]
    fn test_calculated_pnl_and_percent() {
        let entry = Price::new(dec!(0.50));
        let exit = Price::new(dec!(0.55));
        let qty = Size::new(dec!(1000));
        assert_eq!(calculated_pnl(OrderSide::Buy, entry, exit, qty), Some(dec!(50)));
        assert_eq!(calculated_pnl(OrderSide::Sell, entry, exit, qty), Some(dec!(-50)));
        assert_eq!(profit_percent(OrderSide::Buy, entry, exit), dec!(10));
        assert_eq!(profit_percent(OrderSide::Sell, entry, exit), dec!(-10));
    }

    #[test]
    fn test_overflowing_pnl_is_none() {
        let huge = Size::new(Decimal::MAX);
        let one = Price::new(dec!(1));
        let three = Price::new(dec!(3));
        assert_eq!(calculated_pnl(OrderSide::Buy, one, three, huge), None);
        assert_eq!(
            profit_percent(OrderSide::Buy, Price::new(dec!(0.0000000000000000000000000001)), Price::new(Decimal::MAX)),
            Decimal::ZERO
        );

        // The notional sum overflows; realized P&L is still reported.
        let opened = Utc::now();
        let fills = vec![
            fill("ADA", Decimal::MAX, dec!(1), opened, dec!(5)),
            fill("ADA", dec!(1), dec!(1), opened, dec!(5)),
        ];
        let pnl = exchange_pnl(&fills, "ADA", opened).unwrap();
        assert_eq!(pnl.realized, dec!(10));
        assert_eq!(pnl.fill_count, 2);
        assert!(pnl.avg_price.is_none());
    }

    #[test]
    fn test_policy_prefers_meaningful_exchange_pnl() {
        let policy = PnlPolicy::default();

        let chosen = policy.resolve(Some(dec!(48.7)), dec!(50));
        assert_eq!(chosen.source, PnlSource::Exchange);
        assert_eq!(chosen.profit_usd, dec!(48.7));

        let dust = policy.resolve(Some(dec!(0.005)), dec!(50));
        assert_eq!(dust.source, PnlSource::Calculated);
        assert_eq!(dust.profit_usd, dec!(50));

        assert_eq!(policy.resolve(None, dec!(-20)).profit_usd, dec!(-20));
    }
}
