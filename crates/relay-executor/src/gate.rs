//! Pre-trade safety gate.
//!
//! One bracket per subscriber at a time. Any of these blocks the trade:
//! - a position row already exists for this signal
//! - a trade for this signal closed within the cooldown
//! - the exchange reports an open position in any coin
//! - the exchange reports any open order
//!
//! A check that cannot be answered blocks the trade too.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use relay_core::{Signal, Subscriber};
use relay_exchange::DynExchangeClient;
use relay_store::{DynStore, ErrorLogEntry, ErrorType};

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Clear,
    Blocked(String),
    /// A store or exchange query failed.
    Unverified(String),
}

impl GateDecision {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }
}

pub struct SafetyGate {
    store: DynStore,
    cooldown: Duration,
}

impl SafetyGate {
    #[must_use]
    pub fn new(store: DynStore, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub async fn check(
        &self,
        client: &DynExchangeClient,
        subscriber: &Subscriber,
        signal: &Signal,
    ) -> GateDecision {
        let decision = self.evaluate(client, subscriber, signal).await;
        match &decision {
            GateDecision::Clear => {}
            GateDecision::Blocked(reason) => {
                debug!(subscriber = %subscriber.id, signal_id = %signal.id, %reason, "Trade blocked by safety gate");
            }
            GateDecision::Unverified(reason) => {
                warn!(subscriber = %subscriber.id, signal_id = %signal.id, %reason, "Safety check failed, skipping trade");
                let entry = ErrorLogEntry::new(
                    &subscriber.api_key,
                    ErrorType::SafetyCheckError,
                    reason,
                )
                .with_context(json!({ "signal_id": signal.id.as_str(), "coin": signal.coin() }));
                if let Err(e) = self.store.log_error(entry).await {
                    warn!(error = %e, "Failed to write error log");
                }
            }
        }
        decision
    }

    async fn evaluate(
        &self,
        client: &DynExchangeClient,
        subscriber: &Subscriber,
        signal: &Signal,
    ) -> GateDecision {
        match self
            .store
            .has_position_for_signal(subscriber.id, &signal.id)
            .await
        {
            Ok(true) => {
                return GateDecision::Blocked("position already recorded for this signal".into())
            }
            Ok(false) => {}
            Err(e) => return GateDecision::Unverified(format!("position lookup failed: {e}")),
        }

        let since = Utc::now() - self.cooldown;
        match self
            .store
            .recent_trade_for_signal(subscriber.id, &signal.id, since)
            .await
        {
            Ok(true) => {
                return GateDecision::Blocked(format!(
                    "trade for this signal closed within the last {}s",
                    self.cooldown.num_seconds()
                ))
            }
            Ok(false) => {}
            Err(e) => return GateDecision::Unverified(format!("trade lookup failed: {e}")),
        }

        match client.get_open_positions().await {
            Ok(positions) => {
                if let Some(open) = positions.iter().find(|p| p.is_open()) {
                    return GateDecision::Blocked(format!(
                        "open position on {} (szi {})",
                        open.coin, open.szi
                    ));
                }
            }
            Err(e) => {
                return GateDecision::Unverified(format!("open positions query failed: {e}"))
            }
        }

        match client.get_open_orders().await {
            Ok(orders) if !orders.is_empty() => {
                GateDecision::Blocked(format!("{} open order(s) on the account", orders.len()))
            }
            Ok(_) => GateDecision::Clear,
            Err(e) => GateDecision::Unverified(format!("open orders query failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{
        ExitType, NewOpenPosition, NewSignal, NewTrade, OrderId, OrderSide, PnlSource, Price,
        SignalAction, SignalId, Size, SubscriberId,
    };
    use relay_exchange::{OrderRequest, PaperExchange, PaperMarket, PaperOp};
    use relay_store::{MemoryStore, Store};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn signal() -> Signal {
        NewSignal {
            action: SignalAction::Long,
            symbol: "ADA".to_string(),
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
        .into_signal(SignalId::generate(), Utc::now())
    }

    fn setup() -> (Arc<MemoryStore>, SafetyGate, Arc<PaperExchange>, DynExchangeClient) {
        let store = Arc::new(MemoryStore::new());
        let gate = SafetyGate::new(store.clone(), Duration::seconds(60));
        let market = Arc::new(PaperMarket::new());
        market.set_mid("ADA", Price::new(dec!(0.50)));
        let exchange = Arc::new(PaperExchange::new("0xabc", market, dec!(1000)));
        let client: DynExchangeClient = exchange.clone();
        (store, gate, exchange, client)
    }

    #[tokio::test]
    async fn test_clear_account_passes() {
        let (_, gate, _, client) = setup();
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");
        let decision = gate.check(&client, &subscriber, &signal()).await;
        assert_eq!(decision, GateDecision::Clear);
        assert!(decision.is_clear());
    }

    /// Close a position bound to another signal, ledgering the trade
    /// under `signal_id`.
    async fn ledger_trade(
        store: &MemoryStore,
        subscriber: &Subscriber,
        signal_id: &SignalId,
        closed_at: chrono::DateTime<Utc>,
    ) {
        let position = store
            .insert_open_position(NewOpenPosition {
                subscriber_id: subscriber.id,
                signal_id: Some(SignalId::generate()),
                entry_order_id: OrderId(10),
                tp_order_id: OrderId(11),
                sl_order_id: OrderId(12),
                symbol: "ADA/USDT".to_string(),
                coin: "ADA".to_string(),
                side: OrderSide::Buy,
                quantity: Size::new(dec!(1000)),
                leverage: dec!(5),
                entry_fill_price: Price::new(dec!(0.50)),
                target_tp: Price::new(dec!(0.55)),
                target_sl: Price::new(dec!(0.48)),
                opened_at: closed_at - Duration::minutes(10),
            })
            .await
            .unwrap();
        store
            .close_position_with_trade(
                position.id,
                NewTrade {
                    trade_id: NewTrade::generate_id(),
                    subscriber_id: subscriber.id,
                    signal_id: Some(signal_id.clone()),
                    entry_order_id: Some(OrderId(10)),
                    opened_at: position.opened_at,
                    closed_at,
                    symbol: "ADA/USDT".to_string(),
                    side: OrderSide::Buy,
                    entry_price: Price::new(dec!(0.50)),
                    exit_price: Price::new(dec!(0.55)),
                    quantity: Size::new(dec!(1000)),
                    leverage: dec!(5),
                    profit_usd: dec!(50),
                    profit_percent: dec!(10),
                    exit_type: ExitType::Tp,
                    pnl_source: PnlSource::Calculated,
                    fee_charged: dec!(0),
                    notes: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recent_trade_for_signal_blocks_within_cooldown() {
        let (store, gate, _, client) = setup();
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");
        store.upsert_subscriber(subscriber.clone()).await.unwrap();
        let signal = signal();
        ledger_trade(&store, &subscriber, &signal.id, Utc::now() - Duration::seconds(5)).await;

        let decision = gate.check(&client, &subscriber, &signal).await;
        assert!(matches!(decision, GateDecision::Blocked(ref r) if r.contains("within the last 60s")));
    }

    #[tokio::test]
    async fn test_trade_outside_cooldown_does_not_block() {
        let (store, gate, _, client) = setup();
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");
        store.upsert_subscriber(subscriber.clone()).await.unwrap();
        let signal = signal();
        ledger_trade(&store, &subscriber, &signal.id, Utc::now() - Duration::minutes(5)).await;

        assert!(gate.check(&client, &subscriber, &signal).await.is_clear());
    }

    #[tokio::test]
    async fn test_any_open_position_blocks() {
        let (_, gate, exchange, client) = setup();
        exchange.seed_position("BTC", dec!(0.01), Price::new(dec!(60000)));
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");

        let decision = gate.check(&client, &subscriber, &signal()).await;
        assert!(matches!(decision, GateDecision::Blocked(ref r) if r.contains("BTC")));
    }

    #[tokio::test]
    async fn test_any_open_order_blocks() {
        let (_, gate, exchange, client) = setup();
        exchange.seed_order(OrderRequest::take_profit(
            "ETH",
            OrderSide::Sell,
            Size::new(dec!(1)),
            Price::new(dec!(4000)),
        ));
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");

        assert!(matches!(
            gate.check(&client, &subscriber, &signal()).await,
            GateDecision::Blocked(_)
        ));
    }

    #[tokio::test]
    async fn test_query_failure_fails_closed_and_is_logged() {
        let (store, gate, exchange, client) = setup();
        exchange.fail_next(PaperOp::Positions, 1, "gateway timeout");
        let subscriber = Subscriber::new(SubscriberId(1), "rk_1");

        let decision = gate.check(&client, &subscriber, &signal()).await;
        assert!(matches!(decision, GateDecision::Unverified(_)));

        let errors = store.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::SafetyCheckError);
    }
}
