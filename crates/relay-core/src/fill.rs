//! Exchange fills.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::{OrderId, OrderSide};
use crate::{Price, Size};

/// A single execution reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub coin: String,
    pub px: Price,
    pub sz: Size,
    pub side: OrderSide,
    /// Execution time, Unix milliseconds.
    pub time_ms: i64,
    pub oid: Option<OrderId>,
    /// Exchange trade id.
    pub tid: Option<u64>,
    /// Realized P&L the exchange attributes to this fill.
    #[serde(default)]
    pub closed_pnl: Decimal,
}

impl Fill {
    /// Stable dedup key: trade id, else `{oid}_{time_ms}`.
    pub fn fill_id(&self) -> String {
        match (self.tid, self.oid) {
            (Some(tid), _) => tid.to_string(),
            (None, Some(oid)) => format!("{oid}_{}", self.time_ms),
            (None, None) => format!("_{}", self.time_ms),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn notional(&self) -> Decimal {
        self.sz.notional(self.px)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(tid: Option<u64>, oid: Option<u64>) -> Fill {
        Fill {
            coin: "ADA".to_string(),
            px: Price::new(dec!(0.55)),
            sz: Size::new(dec!(100)),
            side: OrderSide::Sell,
            time_ms: 1_700_000_000_000,
            oid: oid.map(OrderId),
            tid,
            closed_pnl: dec!(5),
        }
    }

    #[test]
    fn test_fill_id_prefers_tid() {
        assert_eq!(fill(Some(42), Some(7)).fill_id(), "42");
        assert_eq!(fill(None, Some(7)).fill_id(), "7_1700000000000");
    }

    #[test]
    fn test_fill_time_and_notional() {
        let f = fill(Some(1), None);
        assert_eq!(f.time().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(f.notional(), dec!(55));
    }
}
