//! Position monitor (reconciliation loop).
//!
//! Every tick checks each open position against the exchange. A position
//! that is gone on the exchange is classified (TP or SL), validated against
//! the broadcast signals and either written to the ledger or marked
//! `closed_manual`. Anything ambiguous is left open or flagged
//! `needs_review`; nothing is closed on a guess.
//!
//! After the position pass, fills of every active subscriber are ingested
//! for audit.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{
    ExitType, Fill, NewTrade, OpenPosition, PositionStatus, Price, Subscriber, SubscriberId, Trade,
};
use relay_exchange::{DynExchangeClient, SessionCache};
use relay_executor::alerts::cancel_failed_title;
use relay_executor::{cancel_with_retry, run_in_batches, BatchConfig, RetryPolicy};
use relay_store::{DynStore, ErrorLogEntry, ErrorType, StoreError};
use relay_telemetry::{DynNotifier, Metrics, Severity};

use crate::classifier::{ClassifierKind, CloseEvidence, DynExitClassifier};
use crate::error::{PositionError, PositionResult};
use crate::matcher::SignalMatcher;
use crate::pnl::{calculated_pnl, exchange_pnl, last_exit_price, profit_percent, PnlPolicy};

const LOOP_NAME: &str = "position_monitor";
const SYSTEM_ACCOUNT: &str = "system";

/// Entry and exit closer than this are treated as a bad read.
const SAME_PRICE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

// ============================================================================
// MonitorConfig
// ============================================================================

/// Position monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between ticks. Default: 60.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Positions checked concurrently. Default: 50.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches (ms). Default: 100.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// How far back an unbound position may match a signal. Default: 48h.
    #[serde(default = "default_signal_lookback_hours")]
    pub signal_lookback_hours: i64,
    /// Older fills are not ingested. Default: 24h.
    #[serde(default = "default_fill_lookback_hours")]
    pub fill_lookback_hours: i64,
    /// Exchange P&L at or below this magnitude is ignored. Default: 0.01.
    #[serde(default = "default_pnl_min_abs")]
    pub pnl_min_abs: Decimal,
    /// Log when exchange and calculated P&L differ by more. Default: 0.50.
    #[serde(default = "default_pnl_divergence_warn")]
    pub pnl_divergence_warn: Decimal,
    #[serde(default)]
    pub exit_classifier: ClassifierKind,
    #[serde(default)]
    pub startup_delay_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Sleep after a loop-level error. Default: 10.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    100
}

fn default_signal_lookback_hours() -> i64 {
    48
}

fn default_fill_lookback_hours() -> i64 {
    24
}

fn default_pnl_min_abs() -> Decimal {
    Decimal::new(1, 2)
}

fn default_pnl_divergence_warn() -> Decimal {
    Decimal::new(50, 2)
}

fn default_heartbeat_secs() -> u64 {
    300
}

fn default_error_backoff_secs() -> u64 {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            signal_lookback_hours: default_signal_lookback_hours(),
            fill_lookback_hours: default_fill_lookback_hours(),
            pnl_min_abs: default_pnl_min_abs(),
            pnl_divergence_warn: default_pnl_divergence_warn(),
            exit_classifier: ClassifierKind::default(),
            startup_delay_secs: 0,
            heartbeat_secs: default_heartbeat_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig::new(self.batch_size, Duration::from_millis(self.batch_delay_ms))
    }

    pub fn pnl_policy(&self) -> PnlPolicy {
        PnlPolicy {
            min_abs: self.pnl_min_abs,
            divergence_warn: self.pnl_divergence_warn,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of checking one position.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The exchange still holds a position.
    StillOpen,
    /// No position, yet both protective orders rest. Checked again next tick.
    Anomaly,
    /// Closed but the exit could not be determined reliably.
    NeedsReview(String),
    /// Closed without a matching signal; no ledger entry.
    ClosedManual,
    /// Another monitor closed it first.
    AlreadyClosed,
    /// Closed and written to the ledger.
    Closed(Box<Trade>),
}

impl CheckOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StillOpen => "open",
            Self::Anomaly => "anomaly",
            Self::NeedsReview(_) => "needs_review",
            Self::ClosedManual => "closed_manual",
            Self::AlreadyClosed => "already_closed",
            Self::Closed(_) => "closed",
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub positions: usize,
    pub closed: usize,
    pub closed_manual: usize,
    pub needs_review: usize,
    pub anomalies: usize,
    pub errors: usize,
    pub subscribers_scanned: usize,
    pub fills_ingested: usize,
}

#[derive(Default)]
struct Counters {
    closed: AtomicUsize,
    closed_manual: AtomicUsize,
    needs_review: AtomicUsize,
    anomalies: AtomicUsize,
    errors: AtomicUsize,
    fills: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &PositionResult<CheckOutcome>) {
        let counter = match outcome {
            Ok(CheckOutcome::Closed(_)) => &self.closed,
            Ok(CheckOutcome::ClosedManual) => &self.closed_manual,
            Ok(CheckOutcome::NeedsReview(_)) => &self.needs_review,
            Ok(CheckOutcome::Anomaly) => &self.anomalies,
            Ok(CheckOutcome::StillOpen | CheckOutcome::AlreadyClosed) => return,
            Err(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// PositionMonitor
// ============================================================================

struct Inner {
    store: DynStore,
    sessions: Arc<SessionCache>,
    notifier: DynNotifier,
    classifier: DynExitClassifier,
    matcher: SignalMatcher,
    retry: RetryPolicy,
    pnl: PnlPolicy,
    fill_lookback: chrono::Duration,
}

pub struct PositionMonitor {
    inner: Arc<Inner>,
    config: MonitorConfig,
}

impl PositionMonitor {
    /// Build with the classifier named by `config.exit_classifier`.
    #[must_use]
    pub fn new(
        store: DynStore,
        sessions: Arc<SessionCache>,
        notifier: DynNotifier,
        retry: RetryPolicy,
        config: MonitorConfig,
    ) -> Self {
        let classifier = config.exit_classifier.build();
        Self::with_classifier(store, sessions, notifier, retry, config, classifier)
    }

    /// Build with an explicit exit classification policy.
    #[must_use]
    pub fn with_classifier(
        store: DynStore,
        sessions: Arc<SessionCache>,
        notifier: DynNotifier,
        retry: RetryPolicy,
        config: MonitorConfig,
        classifier: DynExitClassifier,
    ) -> Self {
        let inner = Inner {
            matcher: SignalMatcher::new(
                store.clone(),
                chrono::Duration::hours(config.signal_lookback_hours),
            ),
            classifier,
            pnl: config.pnl_policy(),
            fill_lookback: chrono::Duration::hours(config.fill_lookback_hours),
            store,
            sessions,
            notifier,
            retry,
        };
        Self {
            inner: Arc::new(inner),
            config,
        }
    }

    pub fn classifier_name(&self) -> &'static str {
        self.inner.classifier.name()
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let startup_delay = Duration::from_secs(self.config.startup_delay_secs);
        if !startup_delay.is_zero() {
            info!(delay = ?startup_delay, "Position monitor waiting before first check");
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(startup_delay) => {}
            }
        }

        info!(
            check_interval_secs = self.config.check_interval_secs,
            classifier = self.classifier_name(),
            "Position monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs);
        let mut checks = 0u64;
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            checks += 1;
            let started = Instant::now();
            match self.check_all().await {
                Ok(summary) => {
                    Metrics::loop_tick(LOOP_NAME, started.elapsed().as_secs_f64());
                    if summary.closed + summary.closed_manual + summary.needs_review > 0 {
                        info!(
                            positions = summary.positions,
                            closed = summary.closed,
                            closed_manual = summary.closed_manual,
                            needs_review = summary.needs_review,
                            "Position check finished"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "Position monitor error");
                    Metrics::loop_error(LOOP_NAME);
                    let entry = ErrorLogEntry::new(
                        SYSTEM_ACCOUNT,
                        ErrorType::PositionMonitorLoopError,
                        e.to_string(),
                    )
                    .with_context(json!({ "check_count": checks }));
                    if let Err(log_err) = self.inner.store.log_error(entry).await {
                        warn!(error = %log_err, "Failed to write error log");
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(self.config.error_backoff_secs)) => {}
                    }
                }
            }

            if last_heartbeat.elapsed() >= heartbeat {
                self.heartbeat(checks).await;
                last_heartbeat = Instant::now();
            }
        }

        info!(checks, "Position monitor stopped");
    }

    async fn heartbeat(&self, checks: u64) {
        let positions = self.inner.store.open_positions().await.map(|p| p.len());
        let subscribers = self
            .inner
            .store
            .active_subscribers()
            .await
            .map(|s| s.len());
        match (positions, subscribers) {
            (Ok(positions), Ok(subscribers)) => {
                info!(checks, positions, subscribers, "Position monitor heartbeat");
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(checks, error = %e, "Position monitor heartbeat query failed");
            }
        }
    }

    /// One tick: check every open position, then ingest fills for every
    /// active subscriber.
    ///
    /// # Errors
    /// Only when the open-position or subscriber query fails.
    pub async fn check_all(&self) -> PositionResult<MonitorSummary> {
        let positions = self.inner.store.open_positions().await?;
        Metrics::open_positions(positions.len());
        let total = positions.len();
        let counters = Arc::new(Counters::default());

        if total > 0 {
            debug!(positions = total, "Checking open positions");
            run_in_batches(positions, self.config.batch(), |position| {
                let inner = Arc::clone(&self.inner);
                let counters = Arc::clone(&counters);
                async move {
                    let result = inner.check_position(&position).await;
                    if let Err(e) = &result {
                        warn!(position_id = %position.id, coin = %position.coin, error = %e, "Position check failed");
                    }
                    counters.record(&result);
                }
            })
            .await;
        }

        let subscribers = self.inner.store.active_subscribers().await?;
        let scanned = subscribers.len();
        run_in_batches(subscribers, self.config.batch(), |subscriber| {
            let inner = Arc::clone(&self.inner);
            let counters = Arc::clone(&counters);
            async move {
                match inner.scan_fills(&subscriber).await {
                    Ok(new) => {
                        counters.fills.fetch_add(new, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(subscriber = %subscriber.short_key(), error = %e, "Fill scan failed");
                    }
                }
            }
        })
        .await;

        Ok(MonitorSummary {
            positions: total,
            closed: counters.closed.load(Ordering::Relaxed),
            closed_manual: counters.closed_manual.load(Ordering::Relaxed),
            needs_review: counters.needs_review.load(Ordering::Relaxed),
            anomalies: counters.anomalies.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            subscribers_scanned: scanned,
            fills_ingested: counters.fills.load(Ordering::Relaxed),
        })
    }

    /// Reconcile one position with the exchange.
    pub async fn check_position(&self, position: &OpenPosition) -> PositionResult<CheckOutcome> {
        self.inner.check_position(position).await
    }

    /// Ingest recent fills of one subscriber. Returns the number of new fills.
    pub async fn scan_fills(&self, subscriber: &Subscriber) -> PositionResult<usize> {
        self.inner.scan_fills(subscriber).await
    }
}

impl Inner {
    async fn check_position(&self, position: &OpenPosition) -> PositionResult<CheckOutcome> {
        let subscriber = self
            .store
            .get_subscriber(position.subscriber_id)
            .await?
            .ok_or_else(|| PositionError::SubscriberNotFound(position.subscriber_id.to_string()))?;
        let client = self.sessions.get_or_connect(&subscriber)?;
        let coin = position.coin.as_str();
        let account = subscriber.short_key();

        // 1. Still open?
        let live = client.get_open_positions().await?;
        if live.iter().any(|p| p.coin == coin && p.is_open()) {
            return Ok(CheckOutcome::StillOpen);
        }
        if let Some(other) = live.iter().find(|p| p.is_open()) {
            debug!(subscriber = %account, %coin, other = %other.coin, "Position found on another coin, keeping open");
            return Ok(CheckOutcome::StillOpen);
        }

        // 2. Which protective orders remain
        let (tp_resting, sl_resting) = match client.get_open_orders().await {
            Ok(orders) => (
                Some(orders.iter().any(|o| o.oid == position.tp_order_id)),
                Some(orders.iter().any(|o| o.oid == position.sl_order_id)),
            ),
            Err(e) => {
                warn!(subscriber = %account, %coin, error = %e, "Could not check open orders");
                (None, None)
            }
        };
        if tp_resting == Some(true) && sl_resting == Some(true) {
            warn!(
                subscriber = %account,
                position_id = %position.id,
                %coin,
                "No position but both TP and SL still resting, continuing to monitor"
            );
            return Ok(CheckOutcome::Anomaly);
        }

        // 3. Exit price
        let fills = match client.get_fills().await {
            Ok(fills) => fills,
            Err(e) => {
                warn!(subscriber = %account, %coin, error = %e, "Could not fetch fills");
                Vec::new()
            }
        };
        let Some(exit_price) = last_exit_price(&fills, coin) else {
            return self
                .needs_review(position, "exit price could not be determined")
                .await;
        };
        if (exit_price.inner() - position.entry_fill_price.inner()).abs() < SAME_PRICE_EPSILON {
            error!(
                position_id = %position.id,
                entry = %position.entry_fill_price,
                exit = %exit_price,
                "Entry and exit price are equal"
            );
            return self
                .needs_review(position, "exit price equals entry price")
                .await;
        }

        let evidence = CloseEvidence {
            exit_price,
            tp_resting,
            sl_resting,
        };
        let exit_type = self.classifier.classify(position, &evidence);
        info!(
            subscriber = %account,
            position_id = %position.id,
            symbol = %position.symbol,
            %exit_price,
            exit = %exit_type,
            "Bracket resolved"
        );

        // 4. Ledger or manual
        let outcome = match self.matcher.resolve(position).await? {
            Some(signal_id) => {
                let Some(trade) = self.build_trade(position, signal_id, exit_price, exit_type, &fills)
                else {
                    return self.needs_review(position, "P&L overflows").await;
                };
                match self.store.close_position_with_trade(position.id, trade).await {
                    Ok(trade) => {
                        Metrics::position_closed(PositionStatus::Closed.as_str(), exit_type.as_str());
                        info!(
                            subscriber = %account,
                            trade_id = %trade.details.trade_id,
                            profit = %trade.details.profit_usd,
                            percent = %trade.details.profit_percent.round_dp(2),
                            source = trade.details.pnl_source.as_str(),
                            "Signal trade closed"
                        );
                        CheckOutcome::Closed(Box::new(trade))
                    }
                    Err(StoreError::Conflict(reason)) => {
                        debug!(position_id = %position.id, %reason, "Position already closed");
                        return Ok(CheckOutcome::AlreadyClosed);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                info!(subscriber = %account, symbol = %position.symbol, side = %position.side, "No matching signal, recording manual close");
                self.store
                    .set_position_status(position.id, PositionStatus::ClosedManual)
                    .await?;
                Metrics::position_closed(PositionStatus::ClosedManual.as_str(), exit_type.as_str());
                CheckOutcome::ClosedManual
            }
        };

        // 5. Drop the leg that did not fire, then keep the fills.
        if let Some(oid) = position.remaining_leg(exit_type) {
            let label = match exit_type {
                ExitType::Tp => "SL",
                _ => "TP",
            };
            match cancel_with_retry(&self.retry, &client, coin, oid).await {
                Ok(()) => debug!(%coin, %oid, "Cancelled remaining {label} order"),
                Err(failure) => {
                    warn!(%coin, %oid, error = %failure, "Failed to cancel remaining {label} order");
                    self.notifier
                        .notify(
                            Severity::Warning,
                            &cancel_failed_title(label),
                            &format!(
                                "Account: {account}\nCoin: {coin}\nOrder: {oid}\n\n{}",
                                failure.attempt_log()
                            ),
                        )
                        .await;
                }
            }
        }
        if let Err(e) = self.ingest_fills(subscriber.id, &fills).await {
            warn!(subscriber = %account, error = %e, "Fill ingestion failed");
        }

        Ok(outcome)
    }

    fn build_trade(
        &self,
        position: &OpenPosition,
        signal_id: relay_core::SignalId,
        exit_price: Price,
        exit_type: ExitType,
        fills: &[Fill],
    ) -> Option<NewTrade> {
        let calculated = calculated_pnl(
            position.side,
            position.entry_fill_price,
            exit_price,
            position.quantity,
        )?;
        let exchange = exchange_pnl(fills, &position.coin, position.opened_at);
        let resolved = self
            .pnl
            .resolve(exchange.map(|pnl| pnl.realized), calculated);
        let fill_count = exchange.map_or(0, |pnl| pnl.fill_count);

        Some(NewTrade {
            trade_id: NewTrade::generate_id(),
            subscriber_id: position.subscriber_id,
            signal_id: Some(signal_id),
            entry_order_id: Some(position.entry_order_id),
            opened_at: position.opened_at,
            closed_at: Utc::now(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_fill_price,
            exit_price,
            quantity: position.quantity,
            leverage: position.leverage,
            profit_usd: resolved.profit_usd,
            profit_percent: profit_percent(position.side, position.entry_fill_price, exit_price),
            exit_type,
            pnl_source: resolved.source,
            fee_charged: Decimal::ZERO,
            notes: Some(format!(
                "Signal trade. {fill_count} fills. P&L source: {}",
                resolved.source.as_str()
            )),
        })
    }

    async fn needs_review(
        &self,
        position: &OpenPosition,
        reason: &str,
    ) -> PositionResult<CheckOutcome> {
        warn!(position_id = %position.id, coin = %position.coin, %reason, "Position needs review");
        self.store
            .set_position_status(position.id, PositionStatus::NeedsReview)
            .await?;
        Metrics::position_closed(PositionStatus::NeedsReview.as_str(), ExitType::Unknown.as_str());
        Ok(CheckOutcome::NeedsReview(reason.to_string()))
    }

    async fn scan_fills(&self, subscriber: &Subscriber) -> PositionResult<usize> {
        let client: DynExchangeClient = self.sessions.get_or_connect(subscriber)?;
        let fills = client.get_fills().await?;
        self.ingest_fills(subscriber.id, &fills).await
    }

    /// Store fills inside the lookback window; duplicates are ignored.
    async fn ingest_fills(&self, subscriber: SubscriberId, fills: &[Fill]) -> PositionResult<usize> {
        let cutoff = (Utc::now() - self.fill_lookback).timestamp_millis();
        let mut new = 0usize;
        for fill in fills.iter().filter(|f| f.time_ms >= cutoff) {
            if self.store.record_fill(subscriber, fill.clone()).await? {
                new += 1;
            }
        }
        if new > 0 {
            debug!(subscriber_id = %subscriber, new, "Fills recorded");
            Metrics::fills_ingested(new as u64);
        }
        Ok(new)
    }
}
