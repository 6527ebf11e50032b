//! Trading loop.
//!
//! Every poll fetches all executable deliveries in one store query, then
//! fans out over them in shuffled batches. Each delivery is claimed with a
//! compare-and-set before anything touches the exchange, so two loops (or
//! two overlapping ticks) never execute the same delivery twice. A claimed
//! delivery ends either confirmed with its entry price or failed with a
//! reason; it is never redelivered automatically.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{DeliveryId, DeliveryState, DeliveryStateKind};
use relay_exchange::SessionCache;
use relay_store::{DynStore, ErrorLogEntry, ErrorType, PendingDelivery};
use relay_telemetry::Metrics;

use crate::batch::{run_in_batches, BatchConfig};
use crate::bracket::{BracketExecutor, BracketOutcome};
use crate::error::ExecutorResult;

const LOOP_NAME: &str = "trading";

/// Account recorded on loop-level error log entries.
const SYSTEM_ACCOUNT: &str = "system";

/// Trading loop configuration.
#[derive(Debug, Clone)]
pub struct TradingLoopConfig {
    pub poll_interval: Duration,
    pub batch: BatchConfig,
    /// Signals older than this are not executed.
    pub signal_window: chrono::Duration,
    pub heartbeat_interval: Duration,
    /// Sleep after a loop-level error.
    pub error_backoff: Duration,
    pub startup_delay: Duration,
}

impl Default for TradingLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch: BatchConfig::new(25, Duration::from_millis(50)),
            signal_window: chrono::Duration::minutes(15),
            heartbeat_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(10),
            startup_delay: Duration::ZERO,
        }
    }
}

/// What happened to one delivery in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Executed,
    Failed,
    /// Another worker claimed it first.
    AlreadyClaimed,
    /// The claim itself could not be written; the delivery stays pending.
    Deferred,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub pending: usize,
    pub executed: usize,
    pub failed: usize,
    pub already_claimed: usize,
    pub deferred: usize,
    pub panicked: usize,
}

#[derive(Default)]
struct TickCounters {
    executed: AtomicUsize,
    failed: AtomicUsize,
    already_claimed: AtomicUsize,
    deferred: AtomicUsize,
}

impl TickCounters {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Executed => &self.executed,
            DeliveryOutcome::Failed => &self.failed,
            DeliveryOutcome::AlreadyClaimed => &self.already_claimed,
            DeliveryOutcome::Deferred => &self.deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared with the per-delivery tasks.
struct Worker {
    store: DynStore,
    sessions: Arc<SessionCache>,
    executor: Arc<BracketExecutor>,
}

pub struct TradingLoop {
    worker: Arc<Worker>,
    config: TradingLoopConfig,
}

impl TradingLoop {
    #[must_use]
    pub fn new(
        store: DynStore,
        sessions: Arc<SessionCache>,
        executor: Arc<BracketExecutor>,
        config: TradingLoopConfig,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                sessions,
                executor,
            }),
            config,
        }
    }

    /// Poll until `shutdown` is cancelled. Recoverable errors never end the
    /// loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.startup_delay.is_zero() {
            info!(delay = ?self.config.startup_delay, "Trading loop waiting before first poll");
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.startup_delay) => {}
            }
        }

        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch.batch_size,
            "Trading loop started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut polls = 0u64;
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            polls += 1;
            let started = Instant::now();
            match self.tick().await {
                Ok(summary) => {
                    Metrics::loop_tick(LOOP_NAME, started.elapsed().as_secs_f64());
                    if summary.pending > 0 {
                        info!(
                            pending = summary.pending,
                            executed = summary.executed,
                            failed = summary.failed,
                            already_claimed = summary.already_claimed,
                            "Trading poll finished"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "Trading loop error");
                    Metrics::loop_error(LOOP_NAME);
                    let entry = ErrorLogEntry::new(
                        SYSTEM_ACCOUNT,
                        ErrorType::TradingLoopError,
                        e.to_string(),
                    );
                    if let Err(log_err) = self.worker.store.log_error(entry).await {
                        warn!(error = %log_err, "Failed to write error log");
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                info!(polls, "Trading loop heartbeat");
                last_heartbeat = Instant::now();
            }
        }

        info!(polls, "Trading loop stopped");
    }

    /// One poll: fetch executable deliveries and process them in batches.
    ///
    /// # Errors
    /// Only when the pending-delivery query fails. Per-delivery failures
    /// are recorded on the delivery and counted in the summary.
    pub async fn tick(&self) -> ExecutorResult<TickSummary> {
        let pending = self
            .worker
            .store
            .pending_deliveries(Utc::now(), self.config.signal_window)
            .await?;
        if pending.is_empty() {
            return Ok(TickSummary::default());
        }

        let total = pending.len();
        debug!(pending = total, "Executing pending deliveries");
        let counters = Arc::new(TickCounters::default());
        let stats = run_in_batches(pending, self.config.batch, |item| {
            let worker = Arc::clone(&self.worker);
            let counters = Arc::clone(&counters);
            async move {
                let outcome = worker.process(item).await;
                counters.record(outcome);
            }
        })
        .await;

        Ok(TickSummary {
            pending: total,
            executed: counters.executed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            already_claimed: counters.already_claimed.load(Ordering::Relaxed),
            deferred: counters.deferred.load(Ordering::Relaxed),
            panicked: stats.panicked,
        })
    }
}

impl Worker {
    async fn process(&self, item: PendingDelivery) -> DeliveryOutcome {
        let PendingDelivery {
            delivery,
            signal,
            subscriber,
        } = item;
        let account = subscriber.short_key();

        // Claim before any exchange call.
        let Ok(claimed) = delivery.state.claim(Utc::now()) else {
            return DeliveryOutcome::AlreadyClaimed;
        };
        match self
            .store
            .transition_delivery(delivery.id, DeliveryStateKind::Pending, claimed.clone(), false)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(subscriber = %account, delivery_id = %delivery.id, "Delivery already claimed");
                return DeliveryOutcome::AlreadyClaimed;
            }
            Err(e) => {
                warn!(subscriber = %account, delivery_id = %delivery.id, error = %e, "Failed to claim delivery");
                return DeliveryOutcome::Deferred;
            }
        }
        debug!(subscriber = %account, delivery_id = %delivery.id, signal_id = %signal.id, "Delivery claimed");

        let client = match self.sessions.get_or_connect(&subscriber) {
            Ok(client) => client,
            Err(e) => {
                warn!(subscriber = %account, error = %e, "No exchange session, skipping subscriber");
                let entry = ErrorLogEntry::new(
                    &subscriber.api_key,
                    ErrorType::CredentialsNotFound,
                    e.to_string(),
                )
                .with_context(json!({ "delivery_id": delivery.id.0, "signal_id": signal.id.as_str() }));
                if let Err(log_err) = self.store.log_error(entry).await {
                    warn!(error = %log_err, "Failed to write error log");
                }
                self.record_failure(delivery.id, &claimed, &e.to_string(), &subscriber.api_key)
                    .await;
                return DeliveryOutcome::Failed;
            }
        };

        match self.executor.execute(&client, &subscriber, &signal).await {
            BracketOutcome::Opened { entry_price, .. } => {
                let confirmed = claimed
                    .confirm(Utc::now(), Some(entry_price))
                    .unwrap_or_else(|_| claimed.clone());
                self.finish(delivery.id, confirmed, false, &subscriber.api_key)
                    .await;
                Metrics::delivery("executed");
                DeliveryOutcome::Executed
            }
            other => {
                let reason = other.reason().unwrap_or(other.label()).to_string();
                info!(
                    subscriber = %account,
                    delivery_id = %delivery.id,
                    outcome = other.label(),
                    %reason,
                    "Delivery not executed"
                );
                self.record_failure(delivery.id, &claimed, &reason, &subscriber.api_key)
                    .await;
                DeliveryOutcome::Failed
            }
        }
    }

    async fn record_failure(
        &self,
        id: DeliveryId,
        claimed: &DeliveryState,
        reason: &str,
        api_key: &str,
    ) {
        self.finish(id, claimed.fail(Utc::now(), reason), true, api_key)
            .await;
        Metrics::delivery("failed");
    }

    /// Move a claimed delivery to its final state.
    async fn finish(&self, id: DeliveryId, next: DeliveryState, bump_retry: bool, api_key: &str) {
        let result = self
            .store
            .transition_delivery(id, DeliveryStateKind::AcknowledgedExecuted, next, bump_retry)
            .await;
        let problem = match result {
            Ok(true) => return,
            Ok(false) => "delivery changed state while executing".to_string(),
            Err(e) => e.to_string(),
        };

        warn!(delivery_id = %id, error = %problem, "Failed to record delivery outcome");
        let entry = ErrorLogEntry::new(api_key, ErrorType::SignalProcessingError, &problem)
            .with_context(json!({ "delivery_id": id.0 }));
        if let Err(e) = self.store.log_error(entry).await {
            warn!(error = %e, "Failed to write error log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketConfig;
    use crate::retry::RetryPolicy;
    use relay_core::{NewSignal, Price, SignalAction, SignalId, Subscriber, SubscriberId};
    use relay_exchange::{HexKeyCredentialStore, PaperMarket, PaperSessionFactory};
    use relay_store::{MemoryStore, Store};
    use relay_telemetry::RecordingNotifier;
    use rust_decimal_macros::dec;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    struct Harness {
        store: Arc<MemoryStore>,
        factory: Arc<PaperSessionFactory>,
        trading: TradingLoop,
        subscriber: Subscriber,
    }

    async fn harness(credentials: &str) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let market = Arc::new(PaperMarket::new());
        market.set_mid("ADA", Price::new(dec!(0.50)));
        let factory = Arc::new(PaperSessionFactory::new(market, dec!(1000)));
        let sessions = Arc::new(SessionCache::new(
            Arc::new(HexKeyCredentialStore),
            factory.clone(),
        ));

        let mut subscriber = Subscriber::new(SubscriberId(7), "rk_live_subscriber_seven");
        subscriber.encrypted_credentials = Some(credentials.as_bytes().to_vec());
        store.upsert_subscriber(subscriber.clone()).await.unwrap();

        let executor = Arc::new(BracketExecutor::new(
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            BracketConfig {
                entry_settle: Duration::ZERO,
                ..BracketConfig::default()
            },
            RetryPolicy::default(),
        ));
        let trading = TradingLoop::new(
            store.clone(),
            sessions,
            executor,
            TradingLoopConfig::default(),
        );
        Harness {
            store,
            factory,
            trading,
            subscriber,
        }
    }

    async fn broadcast(store: &MemoryStore, stop_loss: Option<Price>) -> DeliveryId {
        let signal = NewSignal {
            action: SignalAction::Long,
            symbol: "ADA".to_string(),
            entry_price: Price::new(dec!(0.50)),
            stop_loss,
            take_profit: Some(Price::new(dec!(0.55))),
            leverage: Some(dec!(5)),
            risk_fraction: Some(dec!(0.02)),
            timeframe: None,
            trend_strength: None,
            volatility: None,
            notes: None,
        }
        .into_signal(SignalId::generate(), Utc::now());
        store.broadcast_signal(&signal).await.unwrap();
        store
            .latest_pending_delivery(SubscriberId(7))
            .await
            .unwrap()
            .unwrap()
            .delivery
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_executes_and_confirms_delivery() {
        let h = harness(KEY).await;
        let id = broadcast(&h.store, Some(Price::new(dec!(0.48)))).await;

        let summary = h.trading.tick().await.unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.executed, 1);

        let delivery = h.store.get_delivery(id).await.unwrap().unwrap();
        match delivery.state {
            DeliveryState::AcknowledgedExecuted {
                execution_price, ..
            } => assert_eq!(execution_price, Some(Price::new(dec!(0.50)))),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(h.store.positions_for(SubscriberId(7)).await.unwrap().len(), 1);

        // Nothing left to do on the next poll.
        assert_eq!(h.trading.tick().await.unwrap(), TickSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_ticks_execute_once() {
        let h = harness(KEY).await;
        broadcast(&h.store, Some(Price::new(dec!(0.48)))).await;

        let (a, b) = tokio::join!(h.trading.tick(), h.trading.tick());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.executed + b.executed, 1);

        let account = h.factory.account(&h.subscriber);
        let entries = account
            .placed_orders()
            .into_iter()
            .filter(|o| !o.reduce_only)
            .count();
        assert_eq!(entries, 1);
        assert_eq!(h.store.positions_for(SubscriberId(7)).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_signal_marks_delivery_failed() {
        let h = harness(KEY).await;
        let id = broadcast(&h.store, None).await;

        let summary = h.trading.tick().await.unwrap();
        assert_eq!(summary.failed, 1);

        let delivery = h.store.get_delivery(id).await.unwrap().unwrap();
        assert!(delivery.state.is_failed());
        assert!(delivery
            .state
            .failure_reason()
            .unwrap()
            .contains("Signal missing fields"));
        assert_eq!(delivery.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_credentials_fail_only_that_delivery() {
        let h = harness("not-a-key").await;
        let id = broadcast(&h.store, Some(Price::new(dec!(0.48)))).await;

        let summary = h.trading.tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(h.store.get_delivery(id).await.unwrap().unwrap().state.is_failed());

        let errors = h.store.recent_errors(10).await.unwrap();
        assert!(errors
            .iter()
            .any(|e| e.error_type == ErrorType::CredentialsNotFound));
        assert_eq!(h.factory.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let h = harness(KEY).await;
        let trading = Arc::new(h.trading);
        let token = CancellationToken::new();

        let handle = {
            let trading = Arc::clone(&trading);
            let token = token.clone();
            tokio::spawn(async move { trading.run(token).await })
        };
        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
