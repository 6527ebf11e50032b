//! Order bracket executor.
//!
//! Turns a signal and a subscriber's equity into entry, take-profit and
//! stop-loss orders. Legs are strictly sequential: TP is attempted only after
//! the entry filled, SL only after TP rests. A leg that fails after all
//! retries never leaves an unprotected position standing silently: the
//! position is closed at market and the outcome is always alerted.
//!
//! The open position row is written only once all three orders are placed.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use relay_core::{NewOpenPosition, OpenPosition, OrderId, OrderSide, Price, Signal, Size, Subscriber};
use relay_exchange::{DynExchangeClient, OrderRequest};
use relay_store::{DynStore, ErrorLogEntry, ErrorType};
use relay_telemetry::{DynNotifier, Metrics, Severity};

use crate::alerts::{self, AlertContext};
use crate::error::ExecutorError;
use crate::gate::{GateDecision, SafetyGate};
use crate::retry::{cancel_with_retry, place_with_retry, Leg, RetryFailure, RetryPolicy};
use crate::sizing::{size_position, validate_signal};

// ============================================================================
// Configuration
// ============================================================================

/// Execution parameters.
#[derive(Debug, Clone)]
pub struct BracketConfig {
    /// Entry price tolerance in the trade's direction.
    pub slippage_bps: u32,
    pub default_risk_fraction: Decimal,
    pub default_leverage: Decimal,
    /// Size precision when the market does not report one.
    pub default_sz_decimals: u32,
    /// Pause between the entry fill and the TP placement.
    pub entry_settle: Duration,
    pub duplicate_cooldown: chrono::Duration,
    /// Price tolerance of the emergency close (0.02 = 2%).
    pub emergency_slippage: Decimal,
}

impl Default for BracketConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 50,
            default_risk_fraction: Decimal::new(2, 2),
            default_leverage: Decimal::from(5),
            default_sz_decimals: 2,
            entry_settle: Duration::from_secs(2),
            duplicate_cooldown: chrono::Duration::seconds(60),
            emergency_slippage: Decimal::new(2, 2),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of one bracket attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BracketOutcome {
    /// All three orders placed and the position recorded.
    Opened {
        position: OpenPosition,
        entry_price: Price,
    },
    /// The safety gate declined the trade.
    Skipped { reason: String },
    /// Signal or sizing made the trade impossible; nothing was sent.
    Rejected { reason: String },
    /// An order or the position record failed.
    Failed { reason: String },
}

impl BracketOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "opened",
            Self::Skipped { .. } => "skipped",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened { .. })
    }

    /// Human-readable reason for anything but `Opened`.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Opened { .. } => None,
            Self::Skipped { reason } | Self::Rejected { reason } | Self::Failed { reason } => {
                Some(reason)
            }
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct BracketExecutor {
    store: DynStore,
    notifier: DynNotifier,
    gate: SafetyGate,
    retry: RetryPolicy,
    config: BracketConfig,
}

impl BracketExecutor {
    #[must_use]
    pub fn new(
        store: DynStore,
        notifier: DynNotifier,
        config: BracketConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gate: SafetyGate::new(store.clone(), config.duplicate_cooldown),
            store,
            notifier,
            retry,
            config,
        }
    }

    /// Execute one signal for one subscriber.
    pub async fn execute(
        &self,
        client: &DynExchangeClient,
        subscriber: &Subscriber,
        signal: &Signal,
    ) -> BracketOutcome {
        let outcome = self.run(client, subscriber, signal).await;
        Metrics::bracket_outcome(outcome.label());
        outcome
    }

    async fn run(
        &self,
        client: &DynExchangeClient,
        subscriber: &Subscriber,
        signal: &Signal,
    ) -> BracketOutcome {
        let account = subscriber.short_key();
        let coin = signal.coin();
        let side = signal.action.side();
        let ctx = AlertContext::new(&account, signal);

        // 1. Signal data
        let targets = match validate_signal(signal) {
            Ok(targets) => targets,
            Err(rejection) => {
                warn!(subscriber = %account, signal_id = %signal.id, %rejection, "Signal rejected");
                self.notifier
                    .notify(
                        Severity::Warning,
                        rejection.title(),
                        &ctx.details(&rejection.to_string()),
                    )
                    .await;
                return BracketOutcome::Rejected {
                    reason: format!("{}: {rejection}", rejection.title()),
                };
            }
        };

        // 2. Safety gate
        match self.gate.check(client, subscriber, signal).await {
            GateDecision::Clear => {}
            GateDecision::Blocked(reason) | GateDecision::Unverified(reason) => {
                return BracketOutcome::Skipped { reason };
            }
        }

        // 3. Sizing
        let equity = match client.get_equity().await {
            Ok(equity) => equity,
            Err(e) => {
                let reason = format!("Failed to fetch equity: {e}");
                self.log_error(subscriber, ErrorType::TradeExecutionError, &reason, json!({ "coin": coin }))
                    .await;
                return BracketOutcome::Failed { reason };
            }
        };
        let sz_decimals = client
            .sz_decimals(&coin)
            .unwrap_or(self.config.default_sz_decimals);
        let sizing = match size_position(
            equity,
            signal.risk_fraction_or(self.config.default_risk_fraction),
            signal.entry_price,
            targets.stop_loss,
            sz_decimals,
        ) {
            Ok(sizing) => sizing,
            Err(e) => {
                if let ExecutorError::InvalidSignal(detail) = &e {
                    self.notifier
                        .notify(Severity::Warning, "Signal has invalid values", &ctx.details(detail))
                        .await;
                }
                warn!(subscriber = %account, signal_id = %signal.id, %equity, error = %e, "Sizing rejected trade");
                return BracketOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };
        info!(
            subscriber = %account,
            signal_id = %signal.id,
            %coin,
            %side,
            %equity,
            risk_amount = %sizing.risk_amount,
            quantity = %sizing.quantity,
            "Position sized"
        );

        // 4. Leverage (margin only)
        let leverage = signal.leverage_or(self.config.default_leverage);
        let leverage_int = leverage.round().to_u32().unwrap_or(1).max(1);
        if let Err(e) = client.update_leverage(&coin, leverage_int, true).await {
            warn!(subscriber = %account, %coin, leverage = leverage_int, error = %e, "Failed to set leverage, continuing");
        }

        // 5. Entry
        let entry_px = signal
            .entry_price
            .with_slippage_bps(self.config.slippage_bps, side)
            .round_for_exchange();
        let entry_request = OrderRequest::ioc(&coin, side, sizing.quantity, entry_px);
        let entry = match place_with_retry(&self.retry, client, &entry_request, Leg::Entry).await {
            Ok(placed) => placed,
            Err(failure) => {
                return self
                    .entry_failed(subscriber, &ctx.clone().with_quantity(sizing.quantity), &failure)
                    .await;
            }
        };
        let quantity = entry.filled_sz.unwrap_or(sizing.quantity);
        let entry_price = entry.avg_px.unwrap_or(entry_px);
        let ctx = ctx.with_quantity(quantity);
        info!(subscriber = %account, %coin, oid = %entry.oid, price = %entry_price, %quantity, "Entry filled");

        tokio::time::sleep(self.config.entry_settle).await;

        // 6. Take profit
        let close_side = side.opposite();
        let tp_request = OrderRequest::take_profit(
            &coin,
            close_side,
            quantity,
            targets.take_profit.round_for_exchange(),
        );
        let tp = match place_with_retry(&self.retry, client, &tp_request, Leg::TakeProfit).await {
            Ok(placed) => placed,
            Err(failure) => {
                return self
                    .unwind(client, subscriber, &ctx, Leg::TakeProfit, &failure, side, quantity, None)
                    .await;
            }
        };
        debug!(subscriber = %account, %coin, oid = %tp.oid, "Take profit placed");

        // 7. Stop loss
        let sl_request = OrderRequest::stop_loss(
            &coin,
            close_side,
            quantity,
            targets.stop_loss.round_for_exchange(),
        );
        let sl = match place_with_retry(&self.retry, client, &sl_request, Leg::StopLoss).await {
            Ok(placed) => placed,
            Err(failure) => {
                return self
                    .unwind(client, subscriber, &ctx, Leg::StopLoss, &failure, side, quantity, Some(tp.oid))
                    .await;
            }
        };
        debug!(subscriber = %account, %coin, oid = %sl.oid, "Stop loss placed");

        // 8. Record
        let new_position = NewOpenPosition {
            subscriber_id: subscriber.id,
            signal_id: Some(signal.id.clone()),
            entry_order_id: entry.oid,
            tp_order_id: tp.oid,
            sl_order_id: sl.oid,
            symbol: signal.symbol.clone(),
            coin: coin.clone(),
            side,
            quantity,
            leverage,
            entry_fill_price: entry_price,
            target_tp: tp_request.limit_px,
            target_sl: sl_request.limit_px,
            opened_at: Utc::now(),
        };
        match self.store.insert_open_position(new_position).await {
            Ok(position) => {
                info!(
                    subscriber = %account,
                    position_id = %position.id,
                    %coin,
                    entry = %entry_price,
                    tp = %position.target_tp,
                    sl = %position.target_sl,
                    "Bracket opened"
                );
                BracketOutcome::Opened {
                    position,
                    entry_price,
                }
            }
            Err(e) => {
                // Orders are live and protected; only the row is missing.
                let reason = format!("Bracket placed but position record failed: {e}");
                error!(subscriber = %account, %coin, error = %e, "Failed to record open position");
                self.notifier
                    .notify(
                        Severity::Critical,
                        alerts::POSITION_RECORD_FAILED,
                        &ctx.details(&format!(
                            "{reason}\nEntry oid: {}\nTP oid: {}\nSL oid: {}",
                            entry.oid, tp.oid, sl.oid
                        )),
                    )
                    .await;
                self.log_error(
                    subscriber,
                    ErrorType::PositionRecordFailed,
                    &reason,
                    json!({
                        "coin": coin,
                        "entry_oid": entry.oid.value(),
                        "tp_oid": tp.oid.value(),
                        "sl_oid": sl.oid.value(),
                    }),
                )
                .await;
                BracketOutcome::Failed { reason }
            }
        }
    }

    // ========================================================================
    // Failure paths
    // ========================================================================

    async fn entry_failed(
        &self,
        subscriber: &Subscriber,
        ctx: &AlertContext,
        failure: &RetryFailure,
    ) -> BracketOutcome {
        let reason = format!("Entry order failed: {}", failure.last_error());
        error!(subscriber = %ctx.account, coin = %ctx.coin, attempts = failure.attempts(), error = %failure.last_error(), "Entry order failed after all retries");

        self.notifier
            .notify(
                Severity::Critical,
                alerts::ENTRY_ORDER_FAILED,
                &ctx.details(&format!("{reason}\n\n{}", failure.attempt_log())),
            )
            .await;
        self.log_error(
            subscriber,
            ErrorType::EntryOrderFailed,
            &reason,
            json!({ "coin": ctx.coin, "attempts": failure.attempts() }),
        )
        .await;

        BracketOutcome::Failed { reason }
    }

    /// A protective leg failed: drop the orphaned TP if any, close at market
    /// and alert.
    #[allow(clippy::too_many_arguments)]
    async fn unwind(
        &self,
        client: &DynExchangeClient,
        subscriber: &Subscriber,
        ctx: &AlertContext,
        leg: Leg,
        failure: &RetryFailure,
        entry_side: OrderSide,
        quantity: Size,
        orphan_tp: Option<OrderId>,
    ) -> BracketOutcome {
        if let Some(oid) = orphan_tp {
            if let Err(cancel_failure) = cancel_with_retry(&self.retry, client, &ctx.coin, oid).await {
                warn!(coin = %ctx.coin, %oid, error = %cancel_failure, "Failed to cancel orphaned TP");
                self.notifier
                    .notify(
                        Severity::Warning,
                        &alerts::cancel_failed_title(Leg::TakeProfit.label()),
                        &ctx.details(&format!("TP oid {oid}\n\n{}", cancel_failure.attempt_log())),
                    )
                    .await;
            }
        }

        let closed = self.emergency_close(client, &ctx.coin, entry_side, quantity).await;
        let summary = alerts::bracket_incomplete_summary(leg.label(), closed);
        error!(subscriber = %ctx.account, coin = %ctx.coin, %leg, emergency_closed = closed, "{summary}");

        self.notifier
            .notify(
                Severity::Critical,
                alerts::BRACKET_INCOMPLETE,
                &ctx.details(&format!("{summary}\n\n{}", failure.attempt_log())),
            )
            .await;
        if !closed {
            self.notifier
                .notify(
                    Severity::Critical,
                    alerts::MANUAL_INTERVENTION,
                    &ctx.details(&format!(
                        "Unprotected {} position of {quantity} {} could not be closed. Close it manually.",
                        entry_side.position_label(),
                        ctx.coin
                    )),
                )
                .await;
        }

        self.log_error(
            subscriber,
            ErrorType::EmergencyClose,
            &summary,
            json!({
                "coin": ctx.coin,
                "leg": leg.as_str(),
                "emergency_close": closed,
                "last_error": failure.last_error(),
            }),
        )
        .await;

        BracketOutcome::Failed { reason: summary }
    }

    /// Single reduce-only IOC at mid ± the emergency tolerance. Not retried.
    async fn emergency_close(
        &self,
        client: &DynExchangeClient,
        coin: &str,
        entry_side: OrderSide,
        quantity: Size,
    ) -> bool {
        let close_side = entry_side.opposite();
        let mid = match client.get_mid_price(coin).await {
            Ok(Some(mid)) => mid,
            Ok(None) => {
                error!(%coin, "Emergency close impossible: no mid price");
                Metrics::emergency_close(false);
                return false;
            }
            Err(e) => {
                error!(%coin, error = %e, "Emergency close impossible: mid price query failed");
                Metrics::emergency_close(false);
                return false;
            }
        };

        let px = mid
            .with_slippage_fraction(self.config.emergency_slippage, close_side)
            .round_for_exchange();
        let request = OrderRequest::ioc(coin, close_side, quantity, px).reduce_only();
        let result = client
            .place_order(request)
            .await
            .and_then(|response| response.into_placed());

        let closed = match result {
            Ok(placed) if placed.is_filled() => {
                info!(%coin, oid = %placed.oid, price = ?placed.avg_px, "Emergency close filled");
                true
            }
            Ok(placed) => {
                error!(%coin, oid = %placed.oid, "Emergency close did not fill");
                false
            }
            Err(e) => {
                error!(%coin, error = %e, "Emergency close rejected");
                false
            }
        };
        Metrics::emergency_close(closed);
        closed
    }

    async fn log_error(
        &self,
        subscriber: &Subscriber,
        error_type: ErrorType,
        message: &str,
        context: serde_json::Value,
    ) {
        let entry = ErrorLogEntry::new(&subscriber.api_key, error_type, message).with_context(context);
        if let Err(e) = self.store.log_error(entry).await {
            warn!(error = %e, "Failed to write error log");
        }
    }
}
