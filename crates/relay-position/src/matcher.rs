//! Signal-match validation.
//!
//! Only round trips that trace back to a broadcast signal reach the ledger.

use chrono::{Duration, Utc};
use tracing::debug;

use relay_core::{base_symbol, OpenPosition, SignalAction, SignalId};
use relay_store::DynStore;

use crate::error::PositionResult;

pub struct SignalMatcher {
    store: DynStore,
    lookback: Duration,
}

impl SignalMatcher {
    #[must_use]
    pub fn new(store: DynStore, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    /// Signal the position belongs to, if any.
    ///
    /// A bound signal id is used when that signal still exists; otherwise
    /// the newest signal with the same base asset and action inside the
    /// lookback window.
    pub async fn resolve(&self, position: &OpenPosition) -> PositionResult<Option<SignalId>> {
        if let Some(id) = &position.signal_id {
            if self.store.get_signal(id).await?.is_some() {
                return Ok(Some(id.clone()));
            }
            debug!(position_id = %position.id, signal_id = %id, "Bound signal missing, searching by symbol");
        }

        let base = base_symbol(&position.symbol);
        let action = SignalAction::from_side(position.side);
        let since = Utc::now() - self.lookback;
        let found = self
            .store
            .find_matching_signal(&base, action, since)
            .await?
            .map(|signal| signal.id);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        NewOpenPosition, NewSignal, OrderId, OrderSide, PositionId, Price, Signal, Size,
        SubscriberId,
    };
    use relay_store::{MemoryStore, Store};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn signal(symbol: &str, action: SignalAction, age: Duration) -> Signal {
        NewSignal {
            action,
            symbol: symbol.to_string(),
            entry_price: Price::new(dec!(0.50)),
            stop_loss: Some(Price::new(dec!(0.48))),
            take_profit: Some(Price::new(dec!(0.55))),
            leverage: None,
            risk_fraction: None,
            timeframe: None,
            trend_strength: None,
            volatility: None,
            notes: None,
        }
        .into_signal(SignalId::generate(), Utc::now() - age)
    }

    fn position(signal_id: Option<SignalId>, side: OrderSide) -> OpenPosition {
        OpenPosition::from_new(
            PositionId(1),
            NewOpenPosition {
                subscriber_id: SubscriberId(1),
                signal_id,
                entry_order_id: OrderId(1),
                tp_order_id: OrderId(2),
                sl_order_id: OrderId(3),
                symbol: "ADA".to_string(),
                coin: "ADA".to_string(),
                side,
                quantity: Size::new(dec!(100)),
                leverage: dec!(5),
                entry_fill_price: Price::new(dec!(0.50)),
                target_tp: Price::new(dec!(0.55)),
                target_sl: Price::new(dec!(0.48)),
                opened_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_bound_signal_is_kept() {
        let store = Arc::new(MemoryStore::new());
        let s = signal("ADA/USDT", SignalAction::Long, Duration::hours(100));
        store.broadcast_signal(&s).await.unwrap();
        let matcher = SignalMatcher::new(store, Duration::hours(48));

        // Outside the lookback, but bound explicitly.
        let found = matcher
            .resolve(&position(Some(s.id.clone()), OrderSide::Buy))
            .await
            .unwrap();
        assert_eq!(found, Some(s.id));
    }

    #[tokio::test]
    async fn test_unbound_position_matches_by_base_and_action() {
        let store = Arc::new(MemoryStore::new());
        let long = signal("ADA/USDT", SignalAction::Long, Duration::hours(2));
        let short = signal("ADA/USDT", SignalAction::Short, Duration::hours(1));
        let stale = signal("ADA/USDT", SignalAction::Long, Duration::hours(72));
        for s in [&long, &short, &stale] {
            store.broadcast_signal(s).await.unwrap();
        }
        let matcher = SignalMatcher::new(store, Duration::hours(48));

        assert_eq!(
            matcher.resolve(&position(None, OrderSide::Buy)).await.unwrap(),
            Some(long.id)
        );
        assert_eq!(
            matcher.resolve(&position(None, OrderSide::Sell)).await.unwrap(),
            Some(short.id)
        );
    }

    #[tokio::test]
    async fn test_manual_position_has_no_match() {
        let store = Arc::new(MemoryStore::new());
        store
            .broadcast_signal(&signal("BTC/USDT", SignalAction::Long, Duration::hours(1)))
            .await
            .unwrap();
        let matcher = SignalMatcher::new(store, Duration::hours(48));

        assert!(matcher
            .resolve(&position(None, OrderSide::Buy))
            .await
            .unwrap()
            .is_none());
    }
}
