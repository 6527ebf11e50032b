//! Signal service.
//!
//! Every delivery mutation goes through the store's compare-and-set, so a
//! subscriber agent and the trading loop racing on the same delivery never
//! both win.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use relay_core::{
    Delivery, DeliveryId, DeliveryState, NewSignal, OpenPosition, Price, SignalId, SubscriberId,
    Trade,
};
use relay_store::{DeliveryWithSignal, DynStore};
use relay_telemetry::Metrics;

use crate::error::{SignalError, SignalResult};
use crate::types::{BroadcastReceipt, ConfirmOutcome, LatestSignal, LedgerSummary};

/// Validity window of a broadcast signal.
pub const DEFAULT_EXPIRY_MINUTES: i64 = 15;

/// Default page size of `list_failed`.
pub const DEFAULT_FAILED_LIMIT: usize = 50;

/// Reason shown when the billing gate is closed without a stored reason.
const DEFAULT_SUSPENSION_REASON: &str = "Access suspended";

/// Broadcast, poll and acknowledgment protocol over the shared store.
#[derive(Clone)]
pub struct SignalService {
    store: DynStore,
    expiry: Duration,
}

impl SignalService {
    #[must_use]
    pub fn new(store: DynStore) -> Self {
        Self {
            store,
            expiry: Duration::minutes(DEFAULT_EXPIRY_MINUTES),
        }
    }

    #[must_use]
    pub fn with_expiry_minutes(mut self, minutes: i64) -> Self {
        self.expiry = Duration::minutes(minutes);
        self
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    // ========================================================================
    // Broadcast and poll
    // ========================================================================

    /// Persist a new signal and fan it out to every access-granted subscriber.
    ///
    /// Missing risk fraction defaults to 2% and missing leverage to 1x.
    ///
    /// # Errors
    /// `InvalidSignal` for an empty symbol or a non-positive entry price.
    pub async fn broadcast(&self, mut new: NewSignal) -> SignalResult<BroadcastReceipt> {
        if new.symbol.trim().is_empty() {
            return Err(SignalError::InvalidSignal("symbol is empty".to_string()));
        }
        if !new.entry_price.is_positive() {
            return Err(SignalError::InvalidSignal(format!(
                "entry price must be positive, got {}",
                new.entry_price
            )));
        }

        new.risk_fraction.get_or_insert(Decimal::new(2, 2));
        new.leverage.get_or_insert(Decimal::ONE);

        let created_at = Utc::now();
        let signal = new.into_signal(SignalId::generate(), created_at);
        let delivered_to = self.store.broadcast_signal(&signal).await?;

        Metrics::signal_broadcast();
        info!(
            signal_id = %signal.id,
            action = %signal.action,
            symbol = %signal.symbol,
            entry = %signal.entry_price,
            delivered_to,
            "Signal broadcast"
        );

        Ok(BroadcastReceipt {
            signal_id: signal.id,
            delivered_to,
            expires_in_minutes: self.expiry.num_minutes(),
            created_at,
        })
    }

    /// Newest pending signal for a subscriber agent.
    ///
    /// An aged-out signal is reported once as `Expired` and its delivery is
    /// retired so it is never offered again.
    pub async fn latest_signal(&self, subscriber_id: SubscriberId) -> SignalResult<LatestSignal> {
        let subscriber = self
            .store
            .get_subscriber(subscriber_id)
            .await?
            .ok_or_else(|| SignalError::NotFound(format!("subscriber {subscriber_id}")))?;

        if !subscriber.access_granted {
            return Ok(LatestSignal::AccessDenied {
                reason: subscriber
                    .suspension_reason
                    .unwrap_or_else(|| DEFAULT_SUSPENSION_REASON.to_string()),
                amount_due: subscriber.pending_invoice_amount,
            });
        }

        let Some(DeliveryWithSignal { delivery, signal }) =
            self.store.latest_pending_delivery(subscriber_id).await?
        else {
            return Ok(LatestSignal::None);
        };

        let now = Utc::now();
        let age = signal.age(now);
        if signal.is_expired(now, self.expiry) {
            let expired = delivery.state.expire(now)?;
            let changed = self
                .store
                .transition_delivery(delivery.id, delivery.state.kind(), expired, false)
                .await?;
            if changed {
                Metrics::delivery("expired");
            }
            debug!(
                subscriber = %subscriber_id,
                delivery_id = %delivery.id,
                age_minutes = age.num_minutes(),
                "Pending signal expired"
            );
            return Ok(LatestSignal::Expired {
                age_minutes: age.num_minutes(),
            });
        }

        Ok(LatestSignal::Available {
            delivery,
            signal,
            age_seconds: age.num_seconds(),
        })
    }

    // ========================================================================
    // Acknowledgment
    // ========================================================================

    /// Receipt acknowledgment. Repeating it is a no-op.
    pub async fn acknowledge(
        &self,
        subscriber_id: SubscriberId,
        delivery_id: DeliveryId,
    ) -> SignalResult<Delivery> {
        let delivery = self.owned_delivery(subscriber_id, delivery_id).await?;
        let next = delivery.state.acknowledge(Utc::now())?;
        if next == delivery.state {
            return Ok(delivery);
        }
        self.apply(delivery, next, false).await
    }

    /// Record confirmed execution. Idempotent.
    pub async fn confirm_execution(
        &self,
        subscriber_id: SubscriberId,
        delivery_id: DeliveryId,
        executed_at: Option<DateTime<Utc>>,
        execution_price: Option<Price>,
    ) -> SignalResult<ConfirmOutcome> {
        let delivery = self.owned_delivery(subscriber_id, delivery_id).await?;
        if delivery.state.is_confirmed() {
            return Ok(ConfirmOutcome::AlreadyConfirmed);
        }

        let next = delivery
            .state
            .confirm(executed_at.unwrap_or_else(Utc::now), execution_price)?;
        self.apply(delivery, next, false).await?;
        Metrics::delivery("confirmed");
        Ok(ConfirmOutcome::Confirmed)
    }

    /// Mark a delivery failed. Returns the new retry count.
    pub async fn mark_failed(
        &self,
        subscriber_id: SubscriberId,
        delivery_id: DeliveryId,
        reason: &str,
    ) -> SignalResult<u32> {
        let delivery = self.owned_delivery(subscriber_id, delivery_id).await?;
        let next = delivery.state.fail(Utc::now(), reason);
        let updated = self.apply(delivery, next, true).await?;

        warn!(
            subscriber = %subscriber_id,
            delivery_id = %delivery_id,
            reason,
            retry_count = updated.retry_count,
            "Delivery marked failed"
        );
        Metrics::delivery("failed");
        Ok(updated.retry_count)
    }

    /// Failed deliveries, newest signal first.
    pub async fn list_failed(
        &self,
        subscriber_id: SubscriberId,
        limit: Option<usize>,
    ) -> SignalResult<Vec<DeliveryWithSignal>> {
        Ok(self
            .store
            .failed_deliveries(subscriber_id, limit.unwrap_or(DEFAULT_FAILED_LIMIT))
            .await?)
    }

    /// Operator retry: put a failed delivery back in the queue for the next
    /// poll.
    pub async fn retry_failed(
        &self,
        subscriber_id: SubscriberId,
        delivery_id: DeliveryId,
    ) -> SignalResult<Delivery> {
        let delivery = self.owned_delivery(subscriber_id, delivery_id).await?;
        if !delivery.state.is_failed() {
            return Err(SignalError::NotFound(format!(
                "failed delivery {delivery_id}"
            )));
        }

        let next = delivery.state.reset()?;
        let updated = self.apply(delivery, next, false).await?;
        info!(subscriber = %subscriber_id, delivery_id = %delivery_id, "Failed delivery reset for retry");
        Ok(updated)
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub async fn open_positions(
        &self,
        subscriber_id: SubscriberId,
    ) -> SignalResult<Vec<OpenPosition>> {
        Ok(self.store.positions_for(subscriber_id).await?)
    }

    pub async fn trades(
        &self,
        subscriber_id: SubscriberId,
        limit: Option<usize>,
    ) -> SignalResult<Vec<Trade>> {
        Ok(self.store.trades_for(subscriber_id, limit).await?)
    }

    pub async fn ledger(&self, subscriber_id: SubscriberId) -> SignalResult<LedgerSummary> {
        let subscriber = self
            .store
            .get_subscriber(subscriber_id)
            .await?
            .ok_or_else(|| SignalError::NotFound(format!("subscriber {subscriber_id}")))?;
        let trades = self.store.trades_for(subscriber_id, None).await?;

        Ok(LedgerSummary::new(
            subscriber.stats,
            subscriber.billing_cycle_start,
            &trades,
        ))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn owned_delivery(
        &self,
        subscriber_id: SubscriberId,
        delivery_id: DeliveryId,
    ) -> SignalResult<Delivery> {
        self.store
            .get_delivery(delivery_id)
            .await?
            .filter(|d| d.subscriber_id == subscriber_id)
            .ok_or_else(|| SignalError::NotFound(format!("delivery {delivery_id}")))
    }

    async fn apply(
        &self,
        mut delivery: Delivery,
        next: DeliveryState,
        bump_retry: bool,
    ) -> SignalResult<Delivery> {
        let changed = self
            .store
            .transition_delivery(delivery.id, delivery.state.kind(), next.clone(), bump_retry)
            .await?;
        if !changed {
            return Err(SignalError::Conflict(delivery.id.to_string()));
        }

        delivery.state = next;
        if bump_retry {
            delivery.retry_count += 1;
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        ExitType, NewOpenPosition, NewTrade, OrderId, OrderSide, PnlSource, SignalAction, Size,
        Subscriber,
    };
    use relay_store::{MemoryStore, Store};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn new_signal() -> NewSignal {
        NewSignal {
            action: SignalAction::Long,
            symbol: "ADA/USDT".to_string(),
            entry_price: Price::new(dec!(0.50)),
            stop_loss: Some(Price::new(dec!(0.48))),
            take_profit: Some(Price::new(dec!(0.55))),
            leverage: None,
            risk_fraction: None,
            timeframe: Some("1h".to_string()),
            trend_strength: None,
            volatility: None,
            notes: None,
        }
    }

    fn subscriber(id: i64) -> Subscriber {
        let mut s = Subscriber::new(SubscriberId(id), format!("rk_live_{id}"));
        s.encrypted_credentials = Some(vec![1; 32]);
        s
    }

    async fn setup() -> (Arc<MemoryStore>, SignalService) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_subscriber(subscriber(1)).await.unwrap();
        store.upsert_subscriber(subscriber(2)).await.unwrap();
        let service = SignalService::new(store.clone());
        (store, service)
    }

    async fn available(service: &SignalService, id: i64) -> Delivery {
        match service.latest_signal(SubscriberId(id)).await.unwrap() {
            LatestSignal::Available { delivery, .. } => delivery,
            other => panic!("expected available signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_fills_defaults() {
        let (store, service) = setup().await;
        let receipt = service.broadcast(new_signal()).await.unwrap();

        assert_eq!(receipt.delivered_to, 2);
        assert_eq!(receipt.expires_in_minutes, 15);
        assert!(receipt.signal_id.as_str().starts_with("sig_"));
        assert_eq!(receipt.signal_id.as_str().len(), 36);

        let signal = store.get_signal(&receipt.signal_id).await.unwrap().unwrap();
        assert_eq!(signal.risk_fraction, Some(dec!(0.02)));
        assert_eq!(signal.leverage, Some(dec!(1)));
        assert_eq!(signal.timeframe.as_deref(), Some("1h"));
    }

    #[tokio::test]
    async fn test_broadcast_rejects_bad_input() {
        let (_, service) = setup().await;

        let mut empty = new_signal();
        empty.symbol = "  ".to_string();
        assert!(matches!(
            service.broadcast(empty).await,
            Err(SignalError::InvalidSignal(_))
        ));

        let mut zero = new_signal();
        zero.entry_price = Price::ZERO;
        assert!(matches!(
            service.broadcast(zero).await,
            Err(SignalError::InvalidSignal(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_signal_states() {
        let (store, service) = setup().await;
        assert_eq!(
            service.latest_signal(SubscriberId(1)).await.unwrap(),
            LatestSignal::None
        );

        let mut blocked = subscriber(3);
        blocked.access_granted = false;
        blocked.pending_invoice_amount = dec!(42.5);
        store.upsert_subscriber(blocked).await.unwrap();
        assert_eq!(
            service.latest_signal(SubscriberId(3)).await.unwrap(),
            LatestSignal::AccessDenied {
                reason: "Access suspended".to_string(),
                amount_due: dec!(42.5),
            }
        );

        service.broadcast(new_signal()).await.unwrap();
        assert!(service
            .latest_signal(SubscriberId(1))
            .await
            .unwrap()
            .is_available());
    }

    #[tokio::test]
    async fn test_expired_signal_is_retired() {
        let (store, service) = setup().await;
        let stale = new_signal().into_signal(
            SignalId::generate(),
            Utc::now() - Duration::minutes(20),
        );
        store.broadcast_signal(&stale).await.unwrap();

        match service.latest_signal(SubscriberId(1)).await.unwrap() {
            LatestSignal::Expired { age_minutes } => assert!(age_minutes >= 20),
            other => panic!("expected expired, got {other:?}"),
        }

        // Never offered again.
        assert_eq!(
            service.latest_signal(SubscriberId(1)).await.unwrap(),
            LatestSignal::None
        );
        let failed = service.list_failed(SubscriberId(1), None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].delivery.state.failure_reason(),
            Some("signal expired")
        );
    }

    #[tokio::test]
    async fn test_acknowledge_and_confirm_are_idempotent() {
        let (_, service) = setup().await;
        service.broadcast(new_signal()).await.unwrap();
        let delivery = available(&service, 1).await;

        let acked = service
            .acknowledge(SubscriberId(1), delivery.id)
            .await
            .unwrap();
        assert!(!acked.state.is_pending());
        let again = service
            .acknowledge(SubscriberId(1), delivery.id)
            .await
            .unwrap();
        assert_eq!(again.state, acked.state);

        let price = Some(Price::new(dec!(0.5012)));
        assert_eq!(
            service
                .confirm_execution(SubscriberId(1), delivery.id, None, price)
                .await
                .unwrap(),
            ConfirmOutcome::Confirmed
        );
        assert_eq!(
            service
                .confirm_execution(SubscriberId(1), delivery.id, None, price)
                .await
                .unwrap(),
            ConfirmOutcome::AlreadyConfirmed
        );
    }

    #[tokio::test]
    async fn test_delivery_must_belong_to_subscriber() {
        let (_, service) = setup().await;
        service.broadcast(new_signal()).await.unwrap();
        let delivery = available(&service, 1).await;

        assert!(matches!(
            service.acknowledge(SubscriberId(2), delivery.id).await,
            Err(SignalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_list_retry_cycle() {
        let (_, service) = setup().await;
        service.broadcast(new_signal()).await.unwrap();
        let delivery = available(&service, 1).await;

        let retries = service
            .mark_failed(SubscriberId(1), delivery.id, "Insufficient margin")
            .await
            .unwrap();
        assert_eq!(retries, 1);

        let failed = service.list_failed(SubscriberId(1), None).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].delivery.state.failure_reason(),
            Some("Insufficient margin")
        );

        // confirm on a failed delivery is rejected
        assert!(matches!(
            service
                .confirm_execution(SubscriberId(1), delivery.id, None, None)
                .await,
            Err(SignalError::Core(_))
        ));

        let reset = service
            .retry_failed(SubscriberId(1), delivery.id)
            .await
            .unwrap();
        assert!(reset.state.is_pending());
        assert_eq!(reset.retry_count, 1);
        assert!(service
            .latest_signal(SubscriberId(1))
            .await
            .unwrap()
            .is_available());

        // Only failed deliveries can be retried.
        assert!(matches!(
            service.retry_failed(SubscriberId(1), delivery.id).await,
            Err(SignalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_summary() {
        let (store, service) = setup().await;
        let receipt = service.broadcast(new_signal()).await.unwrap();
        let now = Utc::now();

        for (i, profit) in [dec!(5), dec!(-2), dec!(3)].into_iter().enumerate() {
            let oid = u64::try_from(i).unwrap() * 10;
            let position = store
                .insert_open_position(NewOpenPosition {
                    subscriber_id: SubscriberId(1),
                    signal_id: Some(receipt.signal_id.clone()),
                    entry_order_id: OrderId(oid + 1),
                    tp_order_id: OrderId(oid + 2),
                    sl_order_id: OrderId(oid + 3),
                    symbol: "ADA/USDT".to_string(),
                    coin: "ADA".to_string(),
                    side: OrderSide::Buy,
                    quantity: Size::new(dec!(100)),
                    leverage: dec!(5),
                    entry_fill_price: Price::new(dec!(0.50)),
                    target_tp: Price::new(dec!(0.55)),
                    target_sl: Price::new(dec!(0.48)),
                    opened_at: now,
                })
                .await
                .unwrap();
            store
                .close_position_with_trade(
                    position.id,
                    NewTrade {
                        trade_id: NewTrade::generate_id(),
                        subscriber_id: SubscriberId(1),
                        signal_id: Some(receipt.signal_id.clone()),
                        entry_order_id: Some(OrderId(oid + 1)),
                        opened_at: now,
                        closed_at: now,
                        symbol: "ADA/USDT".to_string(),
                        side: OrderSide::Buy,
                        entry_price: Price::new(dec!(0.50)),
                        exit_price: Price::new(dec!(0.55)),
                        quantity: Size::new(dec!(100)),
                        leverage: dec!(5),
                        profit_usd: profit,
                        profit_percent: dec!(1),
                        exit_type: ExitType::Tp,
                        pnl_source: PnlSource::Exchange,
                        fee_charged: dec!(0),
                        notes: None,
                    },
                )
                .await
                .unwrap();
        }

        let ledger = service.ledger(SubscriberId(1)).await.unwrap();
        assert_eq!(ledger.total_trades, 3);
        assert_eq!(ledger.total_profit, dec!(6));
        assert_eq!(ledger.current_cycle_trades, 3);
        assert_eq!(ledger.winning_trades, 2);
        assert_eq!(ledger.losing_trades, 1);
        assert!(ledger.billing_cycle_start.is_some());

        assert_eq!(
            service
                .trades(SubscriberId(1), Some(2))
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(service
            .open_positions(SubscriberId(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_win_rate() {
        let summary = LedgerSummary {
            total_trades: 4,
            total_profit: dec!(10),
            current_cycle_profit: dec!(10),
            current_cycle_trades: 4,
            billing_cycle_start: None,
            winning_trades: 3,
            losing_trades: 1,
        };
        assert_eq!(summary.win_rate(), Some(dec!(75)));
    }
}
