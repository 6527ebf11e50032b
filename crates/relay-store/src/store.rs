//! Store trait.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_core::{
    Delivery, DeliveryId, DeliveryState, DeliveryStateKind, Fill, NewOpenPosition, NewTrade,
    OpenPosition, PositionId, PositionStatus, Signal, SignalAction, SignalId, Subscriber,
    SubscriberId, Trade,
};

use crate::error::StoreResult;
use crate::types::{DeliveryWithSignal, ErrorLogEntry, PendingDelivery};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistent state shared by the signal service and both control loops.
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    /// Insert or replace a subscriber (seeding and admin tooling).
    fn upsert_subscriber(&self, subscriber: Subscriber) -> BoxFuture<'_, StoreResult<()>>;

    fn get_subscriber(&self, id: SubscriberId) -> BoxFuture<'_, StoreResult<Option<Subscriber>>>;

    /// Active subscribers with credentials configured.
    fn active_subscribers(&self) -> BoxFuture<'_, StoreResult<Vec<Subscriber>>>;

    // ------------------------------------------------------------------------
    // Signals and deliveries
    // ------------------------------------------------------------------------

    /// Persist the signal and create one Pending delivery per access-granted
    /// subscriber. Returns the number of deliveries created.
    fn broadcast_signal<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, StoreResult<usize>>;

    fn get_signal<'a>(&'a self, id: &'a SignalId) -> BoxFuture<'a, StoreResult<Option<Signal>>>;

    /// Newest signal whose symbol has `base` as its base asset, with the same
    /// action, created at or after `since`.
    fn find_matching_signal<'a>(
        &'a self,
        base: &'a str,
        action: SignalAction,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<Option<Signal>>>;

    /// Every executable delivery in one query: pending, signal younger than
    /// `window`, subscriber allowed to trade at `now`.
    fn pending_deliveries(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'_, StoreResult<Vec<PendingDelivery>>>;

    /// Newest pending delivery for the subscriber regardless of age.
    fn latest_pending_delivery(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Option<DeliveryWithSignal>>>;

    fn get_delivery(&self, id: DeliveryId) -> BoxFuture<'_, StoreResult<Option<Delivery>>>;

    /// Compare-and-set: apply `next` only if the delivery is currently in
    /// `expected`. Returns whether the row changed.
    fn transition_delivery(
        &self,
        id: DeliveryId,
        expected: DeliveryStateKind,
        next: DeliveryState,
        bump_retry: bool,
    ) -> BoxFuture<'_, StoreResult<bool>>;

    /// Failed deliveries, newest signal first.
    fn failed_deliveries(
        &self,
        subscriber: SubscriberId,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryWithSignal>>>;

    // ------------------------------------------------------------------------
    // Positions and trades
    // ------------------------------------------------------------------------

    /// Any position row (in any status) for this subscriber and signal.
    fn has_position_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// A trade for this subscriber and signal closed after `since`.
    fn recent_trade_for_signal<'a>(
        &'a self,
        subscriber: SubscriberId,
        signal: &'a SignalId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Persist a fully placed bracket and start the subscriber's billing
    /// cycle if it has not started.
    fn insert_open_position(
        &self,
        position: NewOpenPosition,
    ) -> BoxFuture<'_, StoreResult<OpenPosition>>;

    /// All positions in `open` status.
    fn open_positions(&self) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>>;

    /// Open positions for one subscriber.
    fn positions_for(
        &self,
        subscriber: SubscriberId,
    ) -> BoxFuture<'_, StoreResult<Vec<OpenPosition>>>;

    fn set_position_status(
        &self,
        id: PositionId,
        status: PositionStatus,
    ) -> BoxFuture<'_, StoreResult<()>>;

    /// In one transaction: insert the trade, update subscriber stats, start
    /// the billing cycle if unset, mark the position closed.
    ///
    /// Fails with `Conflict` if the position is no longer open.
    fn close_position_with_trade(
        &self,
        id: PositionId,
        trade: NewTrade,
    ) -> BoxFuture<'_, StoreResult<Trade>>;

    /// Trades for the subscriber, most recently closed first.
    fn trades_for(
        &self,
        subscriber: SubscriberId,
        limit: Option<usize>,
    ) -> BoxFuture<'_, StoreResult<Vec<Trade>>>;

    // ------------------------------------------------------------------------
    // Fills and error log
    // ------------------------------------------------------------------------

    /// Store a fill unless its fill id was already recorded. Returns whether
    /// it was new.
    fn record_fill(&self, subscriber: SubscriberId, fill: Fill) -> BoxFuture<'_, StoreResult<bool>>;

    fn fills_for(&self, subscriber: SubscriberId) -> BoxFuture<'_, StoreResult<Vec<Fill>>>;

    fn log_error(&self, entry: ErrorLogEntry) -> BoxFuture<'_, StoreResult<()>>;

    /// Most recent error log entries, newest first.
    fn recent_errors(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<ErrorLogEntry>>>;
}

/// Arc wrapper for Store trait objects.
pub type DynStore = Arc<dyn Store>;
