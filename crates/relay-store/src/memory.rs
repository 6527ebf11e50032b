//! In-process store.
//!
//! All tables live behind one `RwLock`, so every operation (including the
//! close-with-trade transaction) is atomic. Nothing survives a restart.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use relay_core::{
    base_symbol, Delivery, DeliveryId, DeliveryState, DeliveryStateKind, Fill, NewOpenPosition,
    NewTrade, OpenPosition, PositionId, PositionStatus, Signal, SignalAction, SignalId, Subscriber,
    SubscriberId, Trade,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{BoxFuture, Store};
use crate::types::{DeliveryWithSignal, ErrorLogEntry, PendingDelivery};

#[derive(Debug, Default)]
struct Tables {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    signals: HashMap<SignalId, Signal>,
    deliveries: BTreeMap<DeliveryId, Delivery>,
    positions: BTreeMap<PositionId, OpenPosition>,
    trades: Vec<Trade>,
    fills: Vec<(SubscriberId, Fill)>,
    fill_keys: HashSet<(SubscriberId, String)>,
    errors: Vec<ErrorLogEntry>,
    next_delivery_id: i64,
    next_position_id: i64,
    next_trade_id: i64,
}

impl Tables {
    fn with_signal(&self, delivery: &Delivery) -> Option<DeliveryWithSignal> {
        let signal = self.signals.get(&delivery.signal_id)?;
        Some(DeliveryWithSignal {
            delivery: delivery.clone(),
            signal: signal.clone(),
        })
    }
}

/// In-memory `Store`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Synchronous bodies; the trait impl wraps them in ready futures.

    fn broadcast_sync(&self, signal: &Signal) -> StoreResult<usize> {
        let mut t = self.tables.write();
        if t.signals.contains_key(&signal.id) {
            return Err(StoreError::Conflict(format!("signal {} exists", signal.id)));
        }
        t.signals.insert(signal.id.clone(), signal.clone());

        let recipients: Vec<SubscriberId> = t
            .subscribers
            .values()
            .filter(|s| s.access_granted)
            .map(|s| s.id)
            .collect();

        for subscriber_id in &recipients {
            t.next_delivery_id += 1;
            let id = DeliveryId(t.next_delivery_id);
            t.deliveries.insert(
                id,
                Delivery::new(id, signal.id.clone(), *subscriber_id, signal.created_at),
            );
        }
        Ok(recipients.len())
    }

    fn find_matching_sync(
        &self,
        base: &str,
        action: SignalAction,
        since: DateTime<Utc>,
    ) -> Option<Signal> {
        let base = base.to_ascii_uppercase();
        self.tables
            .read()
            .signals
            .values()
            .filter(|s| s.action == action && s.created_at >= since)
            .filter(|s| base_symbol(&s.symbol) == base)
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    fn pending_sync(&self, now: DateTime<Utc>, window: Duration) -> Vec<PendingDelivery> {
        let t = self.tables.read();
        t.deliveries
            .values()
            .filter(|d| d.state.is_pending())
            .filter_map(|d| {
                let signal = t.signals.get(&d.signal_id)?;
                let subscriber = t.subscribers.get(&d.subscriber_id)?;
                if signal.is_expired(now, window) || !subscriber.can_trade(now) {
                    return None;
                }
                Some(PendingDelivery {
                    delivery: d.clone(),
                    signal: signal.clone(),
                    subscriber: subscriber.clone(),
                })
            })
            .collect()
    }

    fn latest_pending_sync(&self, subscriber: SubscriberId) -> Option<DeliveryWithSignal> {
        let t = self.tables.read();
        t.deliveries
            .values()
            .filter(|d| d.subscriber_id == subscriber && d.state.is_pending())
            .filter_map(|d| t.with_signal(d))
            .max_by_key(|ds| (ds.signal.created_at, ds.delivery.id))
    }

    fn transition_sync(
        &self,
        id: DeliveryId,
        expected: DeliveryStateKind,
        next: DeliveryState,
        bump_retry: bool,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write();
        let delivery = t
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {id}")))?;

        if delivery.state.kind() != expected {
            return Ok(false);
        }
        delivery.state = next;
        if bump_retry {
            delivery.retry_count += 1;
        }
        Ok(true)
    }

    fn failed_sync(&self, subscriber: SubscriberId, limit: usize) -> Vec<DeliveryWithSignal> {
        let t = self.tables.read();
        let mut failed: Vec<DeliveryWithSignal> = t
            .deliveries
            .values()
            .filter(|d| d.subscriber_id == subscriber && d.state.is_failed())
            .filter_map(|d| t.with_signal(d))
            .collect();
        failed.sort_by(|a, b| b.signal.created_at.cmp(&a.signal.created_at));
        failed.truncate(limit);
        failed
    }

    fn insert_position_sync(&self, new: NewOpenPosition) -> StoreResult<OpenPosition> {
        let mut t = self.tables.write();
        let subscriber = t
            .subscribers
            .get_mut(&new.subscriber_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscriber {}", new.subscriber_id)))?;
        subscriber.billing_cycle_start.get_or_insert(new.opened_at);

        t.next_position_id += 1;
        let id = PositionId(t.next_position_id);
        let position = OpenPosition::from_new(id, new);
        t.positions.insert(id, position.clone());
        Ok(position)
    }

    fn set_status_sync(&self, id: PositionId, status: PositionStatus) -> StoreResult<()> {
        let mut t = self.tables.write();
        let position = t
            .positions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("position {id}")))?;
        position.status = status;
        Ok(())
    }

    fn close_sync(&self, id: PositionId, trade: NewTrade) -> StoreResult<Trade> {
        let mut t = self.tables.write();

        match t.positions.get(&id) {
            None => return Err(StoreError::NotFound(format!("position {id}"))),
            Some(p) if p.status != PositionStatus::Open => {
                return Err(StoreError::Conflict(format!(
                    "position {id} is {}",
                    p.status
                )))
            }
            Some(_) => {}
        }
        if t.trades.iter().any(|x| x.details.trade_id == trade.trade_id) {
            return Err(StoreError::Conflict(format!("trade {} exists", trade.trade_id)));
        }

        let subscriber = t
            .subscribers
            .get_mut(&trade.subscriber_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscriber {}", trade.subscriber_id)))?;
        subscriber.stats.record_trade(trade.profit_usd);
        subscriber.billing_cycle_start.get_or_insert(trade.closed_at);

        if let Some(position) = t.positions.get_mut(&id) {
            position.status = PositionStatus::Closed;
        }

        t.next_trade_id += 1;
        let stored = Trade {
            id: t.next_trade_id,
            details: trade,
        };
        t.trades.push(stored.clone());
        Ok(stored)
    }

    fn trades_sync(&self, subscriber: SubscriberId, limit: Option<usize>) -> Vec<Trade> {
        let t = self.tables.read();
        let mut trades: Vec<Trade> = t
            .trades
            .iter()
            .filter(|x| x.details.subscriber_id == subscriber)
            .cloned()
            .collect();
        trades.sort_by(|a, b| {
            b.details
                .closed_at
                .cmp(&a.details.closed_at)
                .then(b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            trades.truncate(limit);
        }
        trades
    }

    fn record_fill_sync(&self, subscriber: SubscriberId, fill: Fill) -> bool {
        let mut t = self.tables.write();
        if !t.fill_keys.insert((subscriber, fill.fill_id())) {
            return false;
        }
        t.fills.push((subscriber, fill));
        true
    }
}

impl Store for MemoryStore {
    fn upsert_subscriber(&self, subscriber: Subscriber) -> BoxFuture<'_, StoreResult<()>> {
        self.tables
            .write()
            .subscribers
            .insert(subscriber.id, subscriber);
        Box::pin(std::future::ready(Ok(())))
    }

    fn get_subscriber(&self, id: SubscriberId) -> BoxFuture<'_, StoreResult<Option<Subscriber>>> {
        let found = self.tables.read().subscribers.get(&id).cloned();
        Box::pin(std::future::ready(Ok(found)))
    }

    fn active_subscribers(&self) -> BoxFuture<'_, StoreResult<Vec<Subscriber>>> {
        let active = self
            .tables
            .read()
            .subscribers
            .values()
            .filter(|s| s.active && s.has_credentials())
            .cloned()
            .collect();
        Box::pin(std::future::ready(Ok(active)))
    }

    fn broadcast_signal<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(std::future::ready(self.broadcast_sync(signal)))
    }

    fn get_signal<'a>(&'a self, id: &'a SignalId) -> BoxFuture<'a, StoreResult<Option<Signal>>> {
        let found = self.tables.read().signals.get(id).cloned();
        Box::pin(std::future::ready(Ok(found)))
    }

    fn find_matching_signal<'a>(
        &'a self,
        base: &'a str,
        action: SignalAction,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<Option<Signal>>> {
        Box::pin(std::future::ready(Ok(
            self.find_matching_sync(base, action, since)
        )))
    }

    fn pending_deliveries(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'_, StoreResult<Vec<PendingDelivery>>> {
        Box::pin(std::future::ready(Ok(self.pending_sync(now, window))))
    }

    fn latest_pending_delivery(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Option<DeliveryWithSignal>>> {
        Box::pin(std::future::ready(Ok(self.latest_pending_sync(subscriber))))
    }

    fn get_delivery(&self, id: DeliveryId) -> BoxFuture<'_, StoreResult<Option<Delivery>>> {
        let found = self.tables.read().deliveries.get(&id).cloned();
        Box::pin(std::future::ready(Ok(found)))
    }

    fn transition_delivery(
        &self,
        id: DeliveryId,
        expected: DeliveryStateKind,
        next: DeliveryState,
        bump_retry: bool,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(std::future::ready(
            self.transition_sync(id, expected, next, bump_retry),
        ))
    }

    fn failed_deliveries(
        &self,
        subscriber: SubscriberId,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryWithSignal>>> {
        Box::pin(std::future::ready(Ok(self.failed_sync(subscriber, limit))))
    }

    fn has_position_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        let exists = self
            .tables
            .read()
            .positions
            .values()
            .any(|p| p.subscriber_id == subscriber && p.signal_id.as_ref() == Some(signal));
        Box::pin(std::future::ready(Ok(exists)))
    }

    fn recent_trade_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        let exists = self.tables.read().trades.iter().any(|x| {
            x.details.subscriber_id == subscriber
                && x.details.signal_id.as_ref() == Some(signal)
                && x.details.closed_at > since
        });
        Box::pin(std::future::ready(Ok(exists)))
    }

    fn insert_open_position(
        &self,
        position: NewOpenPosition,
    ) -> BoxFuture<'_, StoreResult<OpenPosition>> {
        Box::pin(std::future::ready(self.insert_position_sync(position)))
    }

    fn open_positions(&self) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>> {
        let open = self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect();
        Box::pin(std::future::ready(Ok(open)))
    }

    fn positions_for(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>> {
        let open = self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| p.subscriber_id == subscriber && p.status == PositionStatus::Open)
            .cloned()
            .collect();
        Box::pin(std::future::ready(Ok(open)))
    }

    fn set_position_status(
        &self,
        id: PositionId,
        status: PositionStatus,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(std::future::ready(self.set_status_sync(id, status)))
    }

    fn close_position_with_trade(
        &self,
        id: PositionId,
        trade: NewTrade,
    ) -> BoxFuture<'_, StoreResult<Trade>> {
        Box::pin(std::future::ready(self.close_sync(id, trade)))
    }

    fn trades_for(
        &self,
        subscriber: SubscriberId,
        limit: Option<usize>,
    ) -> BoxFuture<'_, StoreResult<Vec<Trade>>> {
        Box::pin(std::future::ready(Ok(self.trades_sync(subscriber, limit))))
    }

    fn record_fill(&self, subscriber: SubscriberId, fill: Fill) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(std::future::ready(Ok(self.record_fill_sync(subscriber, fill))))
    }

    fn fills_for(&self, subscriber: SubscriberId) -> BoxFuture<'_, StoreResult<Vec<Fill>>> {
        let fills = self
            .tables
            .read()
            .fills
            .iter()
            .filter(|(id, _)| *id == subscriber)
            .map(|(_, fill)| fill.clone())
            .collect();
        Box::pin(std::future::ready(Ok(fills)))
    }

    fn log_error(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StoreResult<()>> {
        warn!(
            account = %entry.account,
            error_type = %entry.error_type,
            message = %entry.message,
            "Error logged"
        );
        self.tables.write().errors.push(entry);
        Box::pin(std::future::ready(Ok(())))
    }

    fn recent_errors(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<ErrorLogEntry>>> {
        let errors = self
            .tables
            .read()
            .errors
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect();
        Box::pin(std::future::ready(Ok(errors)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;
    use relay_core::{ExitType, NewSignal, OrderId, OrderSide, PnlSource, Price, Size};
    use rust_decimal_macros::dec;

    fn subscriber(id: i64) -> Subscriber {
        let mut s = Subscriber::new(SubscriberId(id), format!("rk_{id}"));
        s.encrypted_credentials = Some(b"key".to_vec());
        s
    }

    fn signal(symbol: &str, action: SignalAction, created_at: DateTime<Utc>) -> Signal {
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
        .into_signal(SignalId::generate(), created_at)
    }

    fn new_position(sub: SubscriberId, signal: Option<SignalId>) -> NewOpenPosition {
        NewOpenPosition {
            subscriber_id: sub,
            signal_id: signal,
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
        }
    }

    fn trade_for(position: &OpenPosition, profit: rust_decimal::Decimal) -> NewTrade {
        NewTrade {
            trade_id: NewTrade::generate_id(),
            subscriber_id: position.subscriber_id,
            signal_id: position.signal_id.clone(),
            entry_order_id: Some(position.entry_order_id),
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_fill_price,
            exit_price: Price::new(dec!(0.55)),
            quantity: position.quantity,
            leverage: position.leverage,
            profit_usd: profit,
            profit_percent: dec!(10),
            exit_type: ExitType::Tp,
            pnl_source: PnlSource::Exchange,
            fee_charged: dec!(0),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_targets_access_granted_only() {
        let store = MemoryStore::new();
        store.upsert_subscriber(subscriber(1)).await.unwrap();
        let mut blocked = subscriber(2);
        blocked.access_granted = false;
        store.upsert_subscriber(blocked).await.unwrap();

        let sig = signal("ADA/USDT", SignalAction::Long, Utc::now());
        assert_eq!(store.broadcast_signal(&sig).await.unwrap(), 1);
        assert!(store.broadcast_signal(&sig).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_eligibility_filters() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_subscriber(subscriber(1)).await.unwrap();
        let mut no_creds = subscriber(2);
        no_creds.encrypted_credentials = None;
        store.upsert_subscriber(no_creds).await.unwrap();

        let fresh = signal("ADA/USDT", SignalAction::Long, now - Duration::minutes(1));
        let stale = signal("BTC/USDT", SignalAction::Long, now - Duration::minutes(20));
        store.broadcast_signal(&fresh).await.unwrap();
        store.broadcast_signal(&stale).await.unwrap();

        let pending = store
            .pending_deliveries(now, Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signal.id, fresh.id);
        assert_eq!(pending[0].subscriber.id, SubscriberId(1));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        store.upsert_subscriber(subscriber(1)).await.unwrap();
        store
            .broadcast_signal(&signal("ADA", SignalAction::Long, Utc::now()))
            .await
            .unwrap();
        let id = store
            .latest_pending_delivery(SubscriberId(1))
            .await
            .unwrap()
            .unwrap()
            .delivery
            .id;

        let claimed = DeliveryState::Pending.claim(Utc::now()).unwrap();
        let first = store
            .transition_delivery(id, DeliveryStateKind::Pending, claimed.clone(), false)
            .await
            .unwrap();
        let second = store
            .transition_delivery(id, DeliveryStateKind::Pending, claimed, false)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let failed = DeliveryState::Pending.fail(Utc::now(), "boom");
        store
            .transition_delivery(id, DeliveryStateKind::AcknowledgedExecuted, failed, true)
            .await
            .unwrap();
        let delivery = store.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(delivery.retry_count, 1);
        assert_eq!(
            store.failed_deliveries(SubscriberId(1), 50).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_with_trade_is_atomic_and_single_shot() {
        let store = MemoryStore::new();
        store.upsert_subscriber(subscriber(1)).await.unwrap();
        let sig = SignalId::generate();
        let position = store
            .insert_open_position(new_position(SubscriberId(1), Some(sig.clone())))
            .await
            .unwrap();

        let sub = store.get_subscriber(SubscriberId(1)).await.unwrap().unwrap();
        assert_eq!(sub.billing_cycle_start, Some(position.opened_at));
        assert!(store
            .has_position_for_signal(SubscriberId(1), &sig)
            .await
            .unwrap());

        store
            .close_position_with_trade(position.id, trade_for(&position, dec!(50)))
            .await
            .unwrap();
        let err = store
            .close_position_with_trade(position.id, trade_for(&position, dec!(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let sub = store.get_subscriber(SubscriberId(1)).await.unwrap().unwrap();
        assert_eq!(sub.stats.total_trades, 1);
        assert_eq!(sub.stats.current_cycle_profit, dec!(50));
        assert!(store.open_positions().await.unwrap().is_empty());
        assert!(store
            .recent_trade_for_signal(SubscriberId(1), &sig, Utc::now() - Duration::seconds(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_find_matching_signal_by_base_and_action() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = signal("ADA/USDT", SignalAction::Long, now - Duration::hours(50));
        let recent = signal("ADA/USDT", SignalAction::Long, now - Duration::hours(2));
        let short = signal("ADA/USDT", SignalAction::Short, now - Duration::hours(1));
        for s in [&old, &recent, &short] {
            store.broadcast_signal(s).await.unwrap();
        }

        let since = now - Duration::hours(48);
        let found = store
            .find_matching_signal("ada", SignalAction::Long, since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, recent.id);
        assert!(store
            .find_matching_signal("BTC", SignalAction::Long, since)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fill_dedup_and_error_log() {
        let store = MemoryStore::new();
        let fill = Fill {
            coin: "ADA".to_string(),
            px: Price::new(dec!(0.55)),
            sz: Size::new(dec!(10)),
            side: OrderSide::Sell,
            time_ms: 1,
            oid: Some(OrderId(2)),
            tid: Some(77),
            closed_pnl: dec!(0.5),
        };
        assert!(store.record_fill(SubscriberId(1), fill.clone()).await.unwrap());
        assert!(!store.record_fill(SubscriberId(1), fill.clone()).await.unwrap());
        assert!(store.record_fill(SubscriberId(2), fill).await.unwrap());
        assert_eq!(store.fills_for(SubscriberId(1)).await.unwrap().len(), 1);

        store
            .log_error(ErrorLogEntry::new("rk_1", ErrorType::EntryOrderFailed, "a"))
            .await
            .unwrap();
        store
            .log_error(ErrorLogEntry::new("rk_1", ErrorType::EmergencyClose, "b"))
            .await
            .unwrap();
        let errors = store.recent_errors(1).await.unwrap();
        assert_eq!(errors[0].error_type, ErrorType::EmergencyClose);
    }
}
