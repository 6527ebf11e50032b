//! PostgreSQL store.
//!
//! Queries are checked at runtime (`sqlx::query`) so the crate builds without
//! a live database. Joined queries alias every column with a table prefix
//! (`u_`, `s_`, `d_`, `p_`, `t_`) and decode through the `*_from_row` helpers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};

use relay_core::{
    base_symbol, Delivery, DeliveryId, DeliveryState, DeliveryStateKind, ExitType, Fill,
    NewOpenPosition, NewTrade, OpenPosition, OrderId, OrderSide, PnlSource, PositionId,
    PositionStatus, Price, Signal, SignalAction, SignalId, Size, Subscriber, SubscriberId,
    SubscriberStats, Trade,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{BoxFuture, Store};
use crate::types::{DeliveryWithSignal, ErrorLogEntry, ErrorType, PendingDelivery};

// ============================================================================
// Column lists
// ============================================================================

macro_rules! subscriber_columns {
    () => {
        "u.id AS u_id, u.api_key AS u_api_key, u.email AS u_email, \
         u.wallet_address AS u_wallet_address, u.encrypted_credentials AS u_encrypted_credentials, \
         u.active AS u_active, u.access_granted AS u_access_granted, \
         u.suspension_reason AS u_suspension_reason, u.pending_invoice_id AS u_pending_invoice_id, \
         u.pending_invoice_amount AS u_pending_invoice_amount, u.invoice_due_date AS u_invoice_due_date, \
         u.billing_cycle_start AS u_billing_cycle_start, u.total_trades AS u_total_trades, \
         u.total_profit AS u_total_profit, u.current_cycle_profit AS u_current_cycle_profit, \
         u.current_cycle_trades AS u_current_cycle_trades"
    };
}

macro_rules! signal_columns {
    () => {
        "s.signal_id AS s_signal_id, s.action AS s_action, s.symbol AS s_symbol, \
         s.entry_price AS s_entry_price, s.stop_loss AS s_stop_loss, s.take_profit AS s_take_profit, \
         s.leverage AS s_leverage, s.risk_fraction AS s_risk_fraction, s.timeframe AS s_timeframe, \
         s.trend_strength AS s_trend_strength, s.volatility AS s_volatility, s.notes AS s_notes, \
         s.created_at AS s_created_at"
    };
}

macro_rules! delivery_columns {
    () => {
        "d.id AS d_id, d.signal_id AS d_signal_id, d.subscriber_id AS d_subscriber_id, \
         d.delivered_at AS d_delivered_at, d.state AS d_state, d.acknowledged_at AS d_acknowledged_at, \
         d.executed_at AS d_executed_at, d.execution_price AS d_execution_price, \
         d.failure_reason AS d_failure_reason, d.retry_count AS d_retry_count"
    };
}

macro_rules! position_columns {
    () => {
        "p.id AS p_id, p.subscriber_id AS p_subscriber_id, p.signal_id AS p_signal_id, \
         p.entry_order_id AS p_entry_order_id, p.tp_order_id AS p_tp_order_id, \
         p.sl_order_id AS p_sl_order_id, p.symbol AS p_symbol, p.coin AS p_coin, p.side AS p_side, \
         p.quantity AS p_quantity, p.leverage AS p_leverage, p.entry_fill_price AS p_entry_fill_price, \
         p.target_tp AS p_target_tp, p.target_sl AS p_target_sl, p.opened_at AS p_opened_at, \
         p.status AS p_status"
    };
}

macro_rules! trade_columns {
    () => {
        "t.id AS t_id, t.trade_id AS t_trade_id, t.subscriber_id AS t_subscriber_id, \
         t.signal_id AS t_signal_id, t.entry_order_id AS t_entry_order_id, t.opened_at AS t_opened_at, \
         t.closed_at AS t_closed_at, t.symbol AS t_symbol, t.side AS t_side, \
         t.entry_price AS t_entry_price, t.exit_price AS t_exit_price, t.quantity AS t_quantity, \
         t.leverage AS t_leverage, t.profit_usd AS t_profit_usd, t.profit_percent AS t_profit_percent, \
         t.exit_type AS t_exit_type, t.pnl_source AS t_pnl_source, t.fee_charged AS t_fee_charged, \
         t.notes AS t_notes"
    };
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed `Store`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections, "Connected to PostgreSQL store");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PgStore {
    fn upsert_subscriber(&self, subscriber: Subscriber) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO subscribers
                    (id, api_key, email, wallet_address, encrypted_credentials, active,
                     access_granted, suspension_reason, pending_invoice_id, pending_invoice_amount,
                     invoice_due_date, billing_cycle_start, total_trades, total_profit,
                     current_cycle_profit, current_cycle_trades)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (id) DO UPDATE SET
                    api_key = EXCLUDED.api_key,
                    email = EXCLUDED.email,
                    wallet_address = EXCLUDED.wallet_address,
                    encrypted_credentials = EXCLUDED.encrypted_credentials,
                    active = EXCLUDED.active,
                    access_granted = EXCLUDED.access_granted,
                    suspension_reason = EXCLUDED.suspension_reason,
                    pending_invoice_id = EXCLUDED.pending_invoice_id,
                    pending_invoice_amount = EXCLUDED.pending_invoice_amount,
                    invoice_due_date = EXCLUDED.invoice_due_date,
                    billing_cycle_start = EXCLUDED.billing_cycle_start,
                    total_trades = EXCLUDED.total_trades,
                    total_profit = EXCLUDED.total_profit,
                    current_cycle_profit = EXCLUDED.current_cycle_profit,
                    current_cycle_trades = EXCLUDED.current_cycle_trades
                "#,
            )
            .bind(subscriber.id.0)
            .bind(&subscriber.api_key)
            .bind(&subscriber.email)
            .bind(&subscriber.wallet_address)
            .bind(&subscriber.encrypted_credentials)
            .bind(subscriber.active)
            .bind(subscriber.access_granted)
            .bind(&subscriber.suspension_reason)
            .bind(&subscriber.pending_invoice_id)
            .bind(subscriber.pending_invoice_amount)
            .bind(subscriber.invoice_due_date)
            .bind(subscriber.billing_cycle_start)
            .bind(subscriber.stats.total_trades)
            .bind(subscriber.stats.total_profit)
            .bind(subscriber.stats.current_cycle_profit)
            .bind(subscriber.stats.current_cycle_trades)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_subscriber(&self, id: SubscriberId) -> BoxFuture<'_, StoreResult<Option<Subscriber>>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                subscriber_columns!(),
                " FROM subscribers u WHERE u.id = $1"
            ))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(subscriber_from_row).transpose()
        })
    }

    fn active_subscribers(&self) -> BoxFuture<'_, StoreResult<Vec<Subscriber>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                subscriber_columns!(),
                " FROM subscribers u WHERE u.active \
                  AND u.encrypted_credentials IS NOT NULL \
                  AND octet_length(u.encrypted_credentials) > 0 \
                  ORDER BY u.id"
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(subscriber_from_row).collect()
        })
    }

    fn broadcast_signal<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, StoreResult<usize>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO signals
                    (signal_id, action, symbol, entry_price, stop_loss, take_profit, leverage,
                     risk_fraction, timeframe, trend_strength, volatility, notes, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(signal.id.as_str())
            .bind(signal.action.as_str())
            .bind(&signal.symbol)
            .bind(signal.entry_price.inner())
            .bind(signal.stop_loss.map(|p| p.inner()))
            .bind(signal.take_profit.map(|p| p.inner()))
            .bind(signal.leverage)
            .bind(signal.risk_fraction)
            .bind(&signal.timeframe)
            .bind(signal.trend_strength)
            .bind(signal.volatility)
            .bind(&signal.notes)
            .bind(signal.created_at)
            .execute(&mut *tx)
            .await?;

            let delivered = sqlx::query(
                r#"
                INSERT INTO deliveries (signal_id, subscriber_id, delivered_at, state)
                SELECT $1, id, $2, 'pending' FROM subscribers WHERE access_granted
                "#,
            )
            .bind(signal.id.as_str())
            .bind(signal.created_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            tx.commit().await?;
            Ok(usize::try_from(delivered).unwrap_or(usize::MAX))
        })
    }

    fn get_signal<'a>(&'a self, id: &'a SignalId) -> BoxFuture<'a, StoreResult<Option<Signal>>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                signal_columns!(),
                " FROM signals s WHERE s.signal_id = $1"
            ))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(signal_from_row).transpose()
        })
    }

    fn find_matching_signal<'a>(
        &'a self,
        base: &'a str,
        action: SignalAction,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<Option<Signal>>> {
        Box::pin(async move {
            let base = base.to_ascii_uppercase();
            // LIKE narrows candidates; the exact base comparison happens below.
            let pattern = format!("%{base}%");
            let rows = sqlx::query(concat!(
                "SELECT ",
                signal_columns!(),
                " FROM signals s WHERE s.action = $1 AND s.created_at >= $2 \
                  AND upper(s.symbol) LIKE $3 ORDER BY s.created_at DESC"
            ))
            .bind(action.as_str())
            .bind(since)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                let signal = signal_from_row(row)?;
                if base_symbol(&signal.symbol) == base {
                    return Ok(Some(signal));
                }
            }
            Ok(None)
        })
    }

    fn pending_deliveries(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'_, StoreResult<Vec<PendingDelivery>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                delivery_columns!(),
                ", ",
                signal_columns!(),
                ", ",
                subscriber_columns!(),
                " FROM deliveries d \
                  JOIN signals s ON s.signal_id = d.signal_id \
                  JOIN subscribers u ON u.id = d.subscriber_id \
                  WHERE d.state = 'pending' \
                    AND u.active AND u.access_granted \
                    AND u.encrypted_credentials IS NOT NULL \
                    AND octet_length(u.encrypted_credentials) > 0 \
                    AND NOT (u.pending_invoice_id IS NOT NULL \
                             AND u.invoice_due_date IS NOT NULL \
                             AND u.invoice_due_date <= $1) \
                    AND s.created_at > $2 \
                  ORDER BY d.id"
            ))
            .bind(now)
            .bind(now - window)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| {
                    Ok(PendingDelivery {
                        delivery: delivery_from_row(row)?,
                        signal: signal_from_row(row)?,
                        subscriber: subscriber_from_row(row)?,
                    })
                })
                .collect()
        })
    }

    fn latest_pending_delivery(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Option<DeliveryWithSignal>>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                delivery_columns!(),
                ", ",
                signal_columns!(),
                " FROM deliveries d JOIN signals s ON s.signal_id = d.signal_id \
                  WHERE d.subscriber_id = $1 AND d.state = 'pending' \
                  ORDER BY s.created_at DESC, d.id DESC LIMIT 1"
            ))
            .bind(subscriber.0)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(delivery_with_signal_from_row).transpose()
        })
    }

    fn get_delivery(&self, id: DeliveryId) -> BoxFuture<'_, StoreResult<Option<Delivery>>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                delivery_columns!(),
                " FROM deliveries d WHERE d.id = $1"
            ))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(delivery_from_row).transpose()
        })
    }

    fn transition_delivery(
        &self,
        id: DeliveryId,
        expected: DeliveryStateKind,
        next: DeliveryState,
        bump_retry: bool,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let columns = StateColumns::from(&next);
            let updated = sqlx::query(
                r#"
                UPDATE deliveries
                SET state = $3,
                    acknowledged_at = $4,
                    executed_at = $5,
                    execution_price = $6,
                    failure_reason = $7,
                    retry_count = retry_count + $8
                WHERE id = $1 AND state = $2
                "#,
            )
            .bind(id.0)
            .bind(expected.as_str())
            .bind(columns.state)
            .bind(columns.acknowledged_at)
            .bind(columns.executed_at)
            .bind(columns.execution_price)
            .bind(columns.failure_reason)
            .bind(i32::from(bump_retry))
            .execute(&self.pool)
            .await?
            .rows_affected();

            if updated == 0 {
                let exists = sqlx::query("SELECT 1 FROM deliveries WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(format!("delivery {id}")));
                }
            }
            Ok(updated == 1)
        })
    }

    fn failed_deliveries(
        &self,
        subscriber: SubscriberId,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryWithSignal>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                delivery_columns!(),
                ", ",
                signal_columns!(),
                " FROM deliveries d JOIN signals s ON s.signal_id = d.signal_id \
                  WHERE d.subscriber_id = $1 AND d.state = 'acknowledged_failed' \
                  ORDER BY s.created_at DESC LIMIT $2"
            ))
            .bind(subscriber.0)
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(delivery_with_signal_from_row).collect()
        })
    }

    fn has_position_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM open_positions WHERE subscriber_id = $1 AND signal_id = $2",
            )
            .bind(subscriber.0)
            .bind(signal.as_str())
            .fetch_one(&self.pool)
            .await?;
            Ok(count > 0)
        })
    }

    fn recent_trade_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM trades
                WHERE subscriber_id = $1 AND signal_id = $2 AND closed_at > $3
                "#,
            )
            .bind(subscriber.0)
            .bind(signal.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
            Ok(count > 0)
        })
    }

    fn insert_open_position(
        &self,
        position: NewOpenPosition,
    ) -> BoxFuture<'_, StoreResult<OpenPosition>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO open_positions
                    (subscriber_id, signal_id, entry_order_id, tp_order_id, sl_order_id, symbol,
                     coin, side, quantity, leverage, entry_fill_price, target_tp, target_sl,
                     opened_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 'open')
                RETURNING id
                "#,
            )
            .bind(position.subscriber_id.0)
            .bind(position.signal_id.as_ref().map(SignalId::as_str))
            .bind(oid_to_db(position.entry_order_id)?)
            .bind(oid_to_db(position.tp_order_id)?)
            .bind(oid_to_db(position.sl_order_id)?)
            .bind(&position.symbol)
            .bind(&position.coin)
            .bind(position.side.as_str())
            .bind(position.quantity.inner())
            .bind(position.leverage)
            .bind(position.entry_fill_price.inner())
            .bind(position.target_tp.inner())
            .bind(position.target_sl.inner())
            .bind(position.opened_at)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE subscribers
                SET billing_cycle_start = COALESCE(billing_cycle_start, $2)
                WHERE id = $1
                "#,
            )
            .bind(position.subscriber_id.0)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(OpenPosition::from_new(PositionId(id), position))
        })
    }

    fn open_positions(&self) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                position_columns!(),
                " FROM open_positions p WHERE p.status = 'open' ORDER BY p.id"
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(position_from_row).collect()
        })
    }

    fn positions_for(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                position_columns!(),
                " FROM open_positions p WHERE p.subscriber_id = $1 AND p.status = 'open' \
                  ORDER BY p.opened_at DESC"
            ))
            .bind(subscriber.0)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(position_from_row).collect()
        })
    }

    fn set_position_status(
        &self,
        id: PositionId,
        status: PositionStatus,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let updated = sqlx::query("UPDATE open_positions SET status = $2 WHERE id = $1")
                .bind(id.0)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
            if updated == 0 {
                return Err(StoreError::NotFound(format!("position {id}")));
            }
            Ok(())
        })
    }

    fn close_position_with_trade(
        &self,
        id: PositionId,
        trade: NewTrade,
    ) -> BoxFuture<'_, StoreResult<Trade>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM open_positions WHERE id = $1 FOR UPDATE")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            match status.as_deref() {
                None => return Err(StoreError::NotFound(format!("position {id}"))),
                Some("open") => {}
                Some(other) => {
                    return Err(StoreError::Conflict(format!("position {id} is {other}")))
                }
            }

            let trade_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO trades
                    (trade_id, subscriber_id, signal_id, entry_order_id, opened_at, closed_at,
                     symbol, side, entry_price, exit_price, quantity, leverage, profit_usd,
                     profit_percent, exit_type, pnl_source, fee_charged, notes)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                RETURNING id
                "#,
            )
            .bind(&trade.trade_id)
            .bind(trade.subscriber_id.0)
            .bind(trade.signal_id.as_ref().map(SignalId::as_str))
            .bind(trade.entry_order_id.map(oid_to_db).transpose()?)
            .bind(trade.opened_at)
            .bind(trade.closed_at)
            .bind(&trade.symbol)
            .bind(trade.side.as_str())
            .bind(trade.entry_price.inner())
            .bind(trade.exit_price.inner())
            .bind(trade.quantity.inner())
            .bind(trade.leverage)
            .bind(trade.profit_usd)
            .bind(trade.profit_percent)
            .bind(trade.exit_type.as_str())
            .bind(trade.pnl_source.as_str())
            .bind(trade.fee_charged)
            .bind(&trade.notes)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE subscribers
                SET total_trades = total_trades + 1,
                    total_profit = total_profit + $2,
                    current_cycle_trades = current_cycle_trades + 1,
                    current_cycle_profit = current_cycle_profit + $2,
                    billing_cycle_start = COALESCE(billing_cycle_start, $3)
                WHERE id = $1
                "#,
            )
            .bind(trade.subscriber_id.0)
            .bind(trade.profit_usd)
            .bind(trade.closed_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE open_positions SET status = 'closed' WHERE id = $1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(Trade {
                id: trade_id,
                details: trade,
            })
        })
    }

    fn trades_for(
        &self,
        subscriber: SubscriberId,
        limit: Option<usize>,
    ) -> BoxFuture<'_, StoreResult<Vec<Trade>>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                trade_columns!(),
                " FROM trades t WHERE t.subscriber_id = $1 \
                  ORDER BY t.closed_at DESC, t.id DESC LIMIT $2"
            ))
            .bind(subscriber.0)
            .bind(limit.map_or(i64::MAX, to_limit))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(trade_from_row).collect()
        })
    }

    fn record_fill(&self, subscriber: SubscriberId, fill: Fill) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r#"
                INSERT INTO fills
                    (subscriber_id, fill_id, coin, px, sz, side, time_ms, oid, tid, closed_pnl)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (subscriber_id, fill_id) DO NOTHING
                "#,
            )
            .bind(subscriber.0)
            .bind(fill.fill_id())
            .bind(&fill.coin)
            .bind(fill.px.inner())
            .bind(fill.sz.inner())
            .bind(fill.side.as_str())
            .bind(fill.time_ms)
            .bind(fill.oid.map(oid_to_db).transpose()?)
            .bind(fill.tid.map(u64_to_db).transpose()?)
            .bind(fill.closed_pnl)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(inserted == 1)
        })
    }

    fn fills_for(&self, subscriber: SubscriberId) -> BoxFuture<'_, StoreResult<Vec<Fill>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT coin, px, sz, side, time_ms, oid, tid, closed_pnl
                FROM fills WHERE subscriber_id = $1 ORDER BY time_ms
                "#,
            )
            .bind(subscriber.0)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(fill_from_row).collect()
        })
    }

    fn log_error(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            warn!(
                account = %entry.account,
                error_type = %entry.error_type,
                message = %entry.message,
                "Error logged"
            );
            sqlx::query(
                r#"
                INSERT INTO error_logs (account, error_type, message, context, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&entry.account)
            .bind(entry.error_type.as_str())
            .bind(&entry.message)
            .bind(&entry.context)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn recent_errors(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<ErrorLogEntry>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT account, error_type, message, context, created_at
                FROM error_logs ORDER BY id DESC LIMIT $1
                "#,
            )
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let error_type: String = row.try_get("error_type")?;
                    Ok(ErrorLogEntry {
                        account: row.try_get("account")?,
                        error_type: ErrorType::parse(&error_type).ok_or_else(|| {
                            StoreError::Decode(format!("unknown error type {error_type}"))
                        })?,
                        message: row.try_get("message")?,
                        context: row.try_get("context")?,
                        created_at: row.try_get("created_at")?,
                    })
                })
                .collect()
        })
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn u64_to_db(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Decode(format!("{value} exceeds BIGINT")))
}

fn oid_to_db(oid: OrderId) -> StoreResult<i64> {
    u64_to_db(oid.value())
}

fn u64_from_db(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Decode(format!("negative id {value}")))
}

fn oid_from_db(value: i64) -> StoreResult<OrderId> {
    u64_from_db(value).map(OrderId)
}

/// Column values for a delivery state.
struct StateColumns {
    state: &'static str,
    acknowledged_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    execution_price: Option<Decimal>,
    failure_reason: Option<String>,
}

impl From<&DeliveryState> for StateColumns {
    fn from(state: &DeliveryState) -> Self {
        let base = Self {
            state: state.kind().as_str(),
            acknowledged_at: state.acknowledged_at(),
            executed_at: None,
            execution_price: None,
            failure_reason: None,
        };
        match state {
            DeliveryState::Pending => base,
            DeliveryState::AcknowledgedExecuted {
                executed_at,
                execution_price,
                ..
            } => Self {
                executed_at: *executed_at,
                execution_price: execution_price.map(|p| p.inner()),
                ..base
            },
            DeliveryState::AcknowledgedFailed { reason, .. } => Self {
                failure_reason: Some(reason.clone()),
                ..base
            },
        }
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn subscriber_from_row(row: &PgRow) -> StoreResult<Subscriber> {
    Ok(Subscriber {
        id: SubscriberId(row.try_get("u_id")?),
        api_key: row.try_get("u_api_key")?,
        email: row.try_get("u_email")?,
        wallet_address: row.try_get("u_wallet_address")?,
        encrypted_credentials: row.try_get("u_encrypted_credentials")?,
        active: row.try_get("u_active")?,
        access_granted: row.try_get("u_access_granted")?,
        suspension_reason: row.try_get("u_suspension_reason")?,
        pending_invoice_id: row.try_get("u_pending_invoice_id")?,
        pending_invoice_amount: row.try_get("u_pending_invoice_amount")?,
        invoice_due_date: row.try_get("u_invoice_due_date")?,
        billing_cycle_start: row.try_get("u_billing_cycle_start")?,
        stats: SubscriberStats {
            total_trades: row.try_get("u_total_trades")?,
            total_profit: row.try_get("u_total_profit")?,
            current_cycle_profit: row.try_get("u_current_cycle_profit")?,
            current_cycle_trades: row.try_get("u_current_cycle_trades")?,
        },
    })
}

fn signal_from_row(row: &PgRow) -> StoreResult<Signal> {
    let action: String = row.try_get("s_action")?;
    let signal_id: String = row.try_get("s_signal_id")?;
    let stop_loss: Option<Decimal> = row.try_get("s_stop_loss")?;
    let take_profit: Option<Decimal> = row.try_get("s_take_profit")?;

    Ok(Signal {
        id: SignalId::from_string(signal_id),
        action: SignalAction::from_side(OrderSide::from_str(&action)?),
        symbol: row.try_get("s_symbol")?,
        entry_price: Price::new(row.try_get("s_entry_price")?),
        stop_loss: stop_loss.map(Price::new),
        take_profit: take_profit.map(Price::new),
        leverage: row.try_get("s_leverage")?,
        risk_fraction: row.try_get("s_risk_fraction")?,
        timeframe: row.try_get("s_timeframe")?,
        trend_strength: row.try_get("s_trend_strength")?,
        volatility: row.try_get("s_volatility")?,
        notes: row.try_get("s_notes")?,
        created_at: row.try_get("s_created_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> StoreResult<Delivery> {
    let id = DeliveryId(row.try_get("d_id")?);
    let state_name: String = row.try_get("d_state")?;
    let kind = DeliveryStateKind::parse(&state_name)
        .ok_or_else(|| StoreError::Decode(format!("delivery {id}: unknown state {state_name}")))?;

    let acknowledged_at: Option<DateTime<Utc>> = row.try_get("d_acknowledged_at")?;
    let missing_ack = || StoreError::Decode(format!("delivery {id}: missing acknowledged_at"));

    let state = match kind {
        DeliveryStateKind::Pending => DeliveryState::Pending,
        DeliveryStateKind::AcknowledgedExecuted => {
            let execution_price: Option<Decimal> = row.try_get("d_execution_price")?;
            DeliveryState::AcknowledgedExecuted {
                acknowledged_at: acknowledged_at.ok_or_else(missing_ack)?,
                executed_at: row.try_get("d_executed_at")?,
                execution_price: execution_price.map(Price::new),
            }
        }
        DeliveryStateKind::AcknowledgedFailed => {
            let reason: Option<String> = row.try_get("d_failure_reason")?;
            DeliveryState::AcknowledgedFailed {
                acknowledged_at: acknowledged_at.ok_or_else(missing_ack)?,
                reason: reason.unwrap_or_default(),
            }
        }
    };

    let signal_id: String = row.try_get("d_signal_id")?;
    let retry_count: i32 = row.try_get("d_retry_count")?;
    Ok(Delivery {
        id,
        signal_id: SignalId::from_string(signal_id),
        subscriber_id: SubscriberId(row.try_get("d_subscriber_id")?),
        delivered_at: row.try_get("d_delivered_at")?,
        state,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    })
}

fn delivery_with_signal_from_row(row: &PgRow) -> StoreResult<DeliveryWithSignal> {
    Ok(DeliveryWithSignal {
        delivery: delivery_from_row(row)?,
        signal: signal_from_row(row)?,
    })
}

fn position_from_row(row: &PgRow) -> StoreResult<OpenPosition> {
    let signal_id: Option<String> = row.try_get("p_signal_id")?;
    let side: String = row.try_get("p_side")?;
    let status: String = row.try_get("p_status")?;

    Ok(OpenPosition {
        id: PositionId(row.try_get("p_id")?),
        subscriber_id: SubscriberId(row.try_get("p_subscriber_id")?),
        signal_id: signal_id.map(SignalId::from_string),
        entry_order_id: oid_from_db(row.try_get("p_entry_order_id")?)?,
        tp_order_id: oid_from_db(row.try_get("p_tp_order_id")?)?,
        sl_order_id: oid_from_db(row.try_get("p_sl_order_id")?)?,
        symbol: row.try_get("p_symbol")?,
        coin: row.try_get("p_coin")?,
        side: OrderSide::from_str(&side)?,
        quantity: Size::new(row.try_get("p_quantity")?),
        leverage: row.try_get("p_leverage")?,
        entry_fill_price: Price::new(row.try_get("p_entry_fill_price")?),
        target_tp: Price::new(row.try_get("p_target_tp")?),
        target_sl: Price::new(row.try_get("p_target_sl")?),
        opened_at: row.try_get("p_opened_at")?,
        status: PositionStatus::from_str(&status)?,
    })
}

fn trade_from_row(row: &PgRow) -> StoreResult<Trade> {
    let signal_id: Option<String> = row.try_get("t_signal_id")?;
    let entry_order_id: Option<i64> = row.try_get("t_entry_order_id")?;
    let side: String = row.try_get("t_side")?;
    let exit_type: String = row.try_get("t_exit_type")?;
    let pnl_source: String = row.try_get("t_pnl_source")?;

    Ok(Trade {
        id: row.try_get("t_id")?,
        details: NewTrade {
            trade_id: row.try_get("t_trade_id")?,
            subscriber_id: SubscriberId(row.try_get("t_subscriber_id")?),
            signal_id: signal_id.map(SignalId::from_string),
            entry_order_id: entry_order_id.map(oid_from_db).transpose()?,
            opened_at: row.try_get("t_opened_at")?,
            closed_at: row.try_get("t_closed_at")?,
            symbol: row.try_get("t_symbol")?,
            side: OrderSide::from_str(&side)?,
            entry_price: Price::new(row.try_get("t_entry_price")?),
            exit_price: Price::new(row.try_get("t_exit_price")?),
            quantity: Size::new(row.try_get("t_quantity")?),
            leverage: row.try_get("t_leverage")?,
            profit_usd: row.try_get("t_profit_usd")?,
            profit_percent: row.try_get("t_profit_percent")?,
            exit_type: ExitType::from_str(&exit_type)?,
            pnl_source: match pnl_source.as_str() {
                "exchange" => PnlSource::Exchange,
                "calculated" => PnlSource::Calculated,
                other => return Err(StoreError::Decode(format!("unknown pnl source {other}"))),
            },
            fee_charged: row.try_get("t_fee_charged")?,
            notes: row.try_get("t_notes")?,
        },
    })
}

fn fill_from_row(row: &PgRow) -> StoreResult<Fill> {
    let side: String = row.try_get("side")?;
    let oid: Option<i64> = row.try_get("oid")?;
    let tid: Option<i64> = row.try_get("tid")?;

    Ok(Fill {
        coin: row.try_get("coin")?,
        px: Price::new(row.try_get("px")?),
        sz: Size::new(row.try_get("sz")?),
        side: OrderSide::from_str(&side)?,
        time_ms: row.try_get("time_ms")?,
        oid: oid.map(oid_from_db).transpose()?,
        tid: tid.map(u64_from_db).transpose()?,
        closed_pnl: row.try_get("closed_pnl")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_state_columns() {
        let now = Utc::now();
        let executed = DeliveryState::Pending
            .confirm(now, Some(Price::new(dec!(0.5))))
            .unwrap();
        let cols = StateColumns::from(&executed);
        assert_eq!(cols.state, "acknowledged_executed");
        assert_eq!(cols.executed_at, Some(now));
        assert_eq!(cols.execution_price, Some(dec!(0.5)));
        assert!(cols.failure_reason.is_none());

        let failed = executed.fail(now, "Entry order failed");
        let cols = StateColumns::from(&failed);
        assert_eq!(cols.state, "acknowledged_failed");
        assert_eq!(cols.acknowledged_at, Some(now));
        assert_eq!(cols.failure_reason.as_deref(), Some("Entry order failed"));

        let cols = StateColumns::from(&DeliveryState::Pending);
        assert_eq!(cols.state, "pending");
        assert!(cols.acknowledged_at.is_none());
    }

    #[test]
    fn test_id_conversions() {
        assert_eq!(oid_to_db(OrderId(42)).unwrap(), 42);
        assert!(oid_to_db(OrderId(u64::MAX)).is_err());
        assert!(oid_from_db(-1).is_err());
        assert_eq!(to_limit(50), 50);
    }
}
