//! Paper trading exchange.
//!
//! Simulates one account against a shared `PaperMarket` of mid prices:
//! - IOC limit orders fill at the mid when marketable, otherwise are rejected
//! - Trigger orders rest and fire lazily on the next account read once the
//!   mid crosses their trigger price
//! - Reduce-only orders never open or flip a position
//!
//! Failures can be injected per operation, and every call is recorded, so
//! the same type doubles as the test exchange.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use relay_core::{
    Fill, OrderId, OrderKind, OrderSide, Price, Size, Subscriber, SubscriberId, TimeInForce, TpSl,
};

use crate::client::{
    BoxFuture, DynExchangeClient, ExchangeClient, ExchangePosition, OpenOrder, OrderRequest,
    OrderResponse,
};
use crate::credentials::SecretKey;
use crate::error::{ExchangeError, ExchangeResult};
use crate::info::InfoClient;
use crate::session::SessionFactory;

const NO_MATCH: &str = "Order could not immediately match against any resting orders";
const REDUCE_ONLY_REJECT: &str = "Reduce only order would increase position";
const CANCEL_MISSING: &str = "Order was never placed, already canceled, or filled";

// ============================================================================
// Market
// ============================================================================

/// Shared mid prices and size decimals.
#[derive(Debug, Default)]
pub struct PaperMarket {
    mids: RwLock<HashMap<String, Price>>,
    sz_decimals: RwLock<HashMap<String, u32>>,
}

impl PaperMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mid(&self, coin: &str, mid: Price) {
        self.mids.write().insert(coin.to_string(), mid);
    }

    pub fn mid(&self, coin: &str) -> Option<Price> {
        self.mids.read().get(coin).copied()
    }

    pub fn set_sz_decimals(&self, coin: &str, decimals: u32) {
        self.sz_decimals.write().insert(coin.to_string(), decimals);
    }

    pub fn sz_decimals(&self, coin: &str) -> Option<u32> {
        self.sz_decimals.read().get(coin).copied()
    }

    /// Pull mids (and size decimals on first call) from the info endpoint.
    ///
    /// Returns the number of mids updated.
    pub async fn refresh(&self, info: &InfoClient) -> ExchangeResult<usize> {
        if self.sz_decimals.read().is_empty() {
            let meta = info.sz_decimals().await?;
            self.sz_decimals.write().extend(meta);
        }

        let mids = info.all_mids().await?;
        let count = mids.len();
        self.mids.write().extend(mids);
        debug!(count, "Paper market mids refreshed");
        Ok(count)
    }
}

// ============================================================================
// Account state
// ============================================================================

/// Operation classes for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    /// Non-reduce-only limit order.
    Entry,
    TakeProfit,
    StopLoss,
    /// Reduce-only limit order.
    Close,
    Cancel,
    Leverage,
    Equity,
    Positions,
    OpenOrders,
    Fills,
    Mid,
}

impl PaperOp {
    fn for_request(request: &OrderRequest) -> Self {
        match request.kind {
            OrderKind::Trigger {
                tpsl: TpSl::Tp, ..
            } => Self::TakeProfit,
            OrderKind::Trigger {
                tpsl: TpSl::Sl, ..
            } => Self::StopLoss,
            OrderKind::Limit { .. } if request.reduce_only => Self::Close,
            OrderKind::Limit { .. } => Self::Entry,
        }
    }
}

/// Recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperCall {
    Place(OrderRequest),
    Cancel { coin: String, oid: OrderId },
    Leverage { coin: String, leverage: u32, is_cross: bool },
}

#[derive(Debug, Default, Clone, Copy)]
struct PaperPosition {
    szi: Decimal,
    entry_px: Decimal,
}

#[derive(Debug)]
struct PaperAccount {
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: BTreeMap<OrderId, OrderRequest>,
    fills: Vec<Fill>,
    next_oid: u64,
    next_tid: u64,
}

impl PaperAccount {
    fn new(cash: Decimal) -> Self {
        Self {
            cash,
            positions: HashMap::new(),
            orders: BTreeMap::new(),
            fills: Vec::new(),
            next_oid: 1_000,
            next_tid: 1,
        }
    }

    fn next_oid(&mut self) -> OrderId {
        let oid = OrderId(self.next_oid);
        self.next_oid += 1;
        oid
    }

    fn position_szi(&self, coin: &str) -> Decimal {
        self.positions.get(coin).map_or(Decimal::ZERO, |p| p.szi)
    }

    /// Largest size a reduce-only order on `side` may execute.
    fn reducible(&self, coin: &str, side: OrderSide) -> Decimal {
        let szi = self.position_szi(coin);
        let reduces = (szi > Decimal::ZERO && side == OrderSide::Sell)
            || (szi < Decimal::ZERO && side == OrderSide::Buy);
        if reduces {
            szi.abs()
        } else {
            Decimal::ZERO
        }
    }

    /// Apply an execution and return the realized P&L.
    fn apply_fill(
        &mut self,
        coin: &str,
        side: OrderSide,
        sz: Decimal,
        px: Price,
        oid: OrderId,
    ) -> Decimal {
        let delta = if side.is_buy() { sz } else { -sz };
        let position = self.positions.entry(coin.to_string()).or_default();
        let mut closed_pnl = Decimal::ZERO;

        let same_direction = position.szi.is_zero()
            || (position.szi > Decimal::ZERO) == (delta > Decimal::ZERO);

        if same_direction {
            let new_szi = position.szi + delta;
            position.entry_px =
                (position.entry_px * position.szi.abs() + px.inner() * sz) / new_szi.abs();
            position.szi = new_szi;
        } else {
            let closing = sz.min(position.szi.abs());
            let direction = if position.szi > Decimal::ZERO {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            closed_pnl = (px.inner() - position.entry_px) * closing * direction;

            let new_szi = position.szi + delta;
            if !new_szi.is_zero() && (new_szi > Decimal::ZERO) != (position.szi > Decimal::ZERO) {
                position.entry_px = px.inner();
            }
            position.szi = new_szi;
        }

        if position.szi.is_zero() {
            self.positions.remove(coin);
        }

        self.cash += closed_pnl;
        let tid = self.next_tid;
        self.next_tid += 1;
        self.fills.push(Fill {
            coin: coin.to_string(),
            px,
            sz: Size::new(sz),
            side,
            time_ms: Utc::now().timestamp_millis(),
            oid: Some(oid),
            tid: Some(tid),
            closed_pnl,
        });

        closed_pnl
    }
}

// ============================================================================
// Exchange
// ============================================================================

/// Simulated exchange account.
pub struct PaperExchange {
    account: String,
    market: Arc<PaperMarket>,
    state: Mutex<PaperAccount>,
    failures: Mutex<HashMap<PaperOp, VecDeque<String>>>,
    calls: Mutex<Vec<PaperCall>>,
    attempts: Mutex<HashMap<PaperOp, usize>>,
}

impl PaperExchange {
    pub fn new(account: impl Into<String>, market: Arc<PaperMarket>, equity: Decimal) -> Self {
        Self {
            account: account.into(),
            market,
            state: Mutex::new(PaperAccount::new(equity)),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn market(&self) -> &Arc<PaperMarket> {
        &self.market
    }

    // ------------------------------------------------------------------------
    // Test and simulation controls
    // ------------------------------------------------------------------------

    /// Make the next `times` calls of `op` fail with `message`.
    ///
    /// Order placements fail with `OrderResponse::Error`; everything else
    /// returns an `ExchangeError`.
    pub fn fail_next(&self, op: PaperOp, times: usize, message: &str) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(op).or_default();
        queue.extend(std::iter::repeat(message.to_string()).take(times));
    }

    /// Number of times `op` was invoked, failed or not.
    pub fn attempts(&self, op: PaperOp) -> usize {
        self.attempts.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<PaperCall> {
        self.calls.lock().clone()
    }

    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PaperCall::Place(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cancelled(&self) -> Vec<OrderId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PaperCall::Cancel { oid, .. } => Some(*oid),
                _ => None,
            })
            .collect()
    }

    pub fn set_cash(&self, cash: Decimal) {
        self.state.lock().cash = cash;
    }

    /// Seed a position directly, bypassing order flow.
    pub fn seed_position(&self, coin: &str, szi: Decimal, entry_px: Price) {
        let mut state = self.state.lock();
        if szi.is_zero() {
            state.positions.remove(coin);
        } else {
            state.positions.insert(
                coin.to_string(),
                PaperPosition {
                    szi,
                    entry_px: entry_px.inner(),
                },
            );
        }
    }

    /// Seed a resting order directly, bypassing order flow.
    pub fn seed_order(&self, request: OrderRequest) -> OrderId {
        let mut state = self.state.lock();
        let oid = state.next_oid();
        state.orders.insert(oid, request);
        oid
    }

    pub fn seed_fill(&self, fill: Fill) {
        self.state.lock().fills.push(fill);
    }

    /// Signed position size on `coin`, zero when flat.
    pub fn position_size(&self, coin: &str) -> Decimal {
        self.state.lock().position_szi(coin)
    }

    pub fn resting_order_ids(&self) -> Vec<OrderId> {
        self.state.lock().orders.keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn enter(&self, op: PaperOp) -> Option<String> {
        *self.attempts.lock().entry(op).or_insert(0) += 1;
        self.failures
            .lock()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }

    fn place(&self, request: OrderRequest) -> OrderResponse {
        let op = PaperOp::for_request(&request);
        self.calls.lock().push(PaperCall::Place(request.clone()));
        if let Some(message) = self.enter(op) {
            return OrderResponse::Error(message);
        }
        if !request.size.is_positive() {
            return OrderResponse::Error("Order has zero size".to_string());
        }

        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);

        match request.kind {
            OrderKind::Trigger { .. } => {
                let oid = state.next_oid();
                debug!(account = %self.account, coin = %request.coin, %oid, "Paper trigger resting");
                state.orders.insert(oid, request);
                OrderResponse::Resting { oid }
            }
            OrderKind::Limit { tif } => {
                let Some(mid) = self.market.mid(&request.coin) else {
                    return OrderResponse::Error(format!("No market for {}", request.coin));
                };

                let marketable = match request.side {
                    OrderSide::Buy => request.limit_px >= mid,
                    OrderSide::Sell => request.limit_px <= mid,
                };
                if !marketable {
                    if tif == TimeInForce::GoodTilCancelled {
                        let oid = state.next_oid();
                        state.orders.insert(oid, request);
                        return OrderResponse::Resting { oid };
                    }
                    return OrderResponse::Error(format!("{NO_MATCH}. asset={}", request.coin));
                }

                let mut size = request.size.inner();
                if request.reduce_only {
                    size = size.min(state.reducible(&request.coin, request.side));
                    if size.is_zero() {
                        return OrderResponse::Error(REDUCE_ONLY_REJECT.to_string());
                    }
                }

                let oid = state.next_oid();
                state.apply_fill(&request.coin, request.side, size, mid, oid);
                info!(
                    account = %self.account,
                    coin = %request.coin,
                    side = %request.side,
                    size = %size,
                    price = %mid,
                    "Paper order filled"
                );
                OrderResponse::Filled {
                    oid,
                    avg_px: mid,
                    total_sz: Size::new(size),
                }
            }
        }
    }

    /// Fire resting triggers whose price has been crossed.
    fn evaluate_triggers(&self, state: &mut PaperAccount) {
        let fired: Vec<(OrderId, Price)> = state
            .orders
            .iter()
            .filter_map(|(oid, request)| {
                let OrderKind::Trigger {
                    trigger_px, tpsl, ..
                } = request.kind
                else {
                    return None;
                };
                let mid = self.market.mid(&request.coin)?;
                let crossed = match (request.side, tpsl) {
                    (OrderSide::Sell, TpSl::Tp) | (OrderSide::Buy, TpSl::Sl) => mid >= trigger_px,
                    (OrderSide::Sell, TpSl::Sl) | (OrderSide::Buy, TpSl::Tp) => mid <= trigger_px,
                };
                let fill_px = match tpsl {
                    TpSl::Tp => trigger_px,
                    TpSl::Sl => mid,
                };
                crossed.then_some((*oid, fill_px))
            })
            .collect();

        for (oid, fill_px) in fired {
            let Some(request) = state.orders.remove(&oid) else {
                continue;
            };
            let mut size = request.size.inner();
            if request.reduce_only {
                size = size.min(state.reducible(&request.coin, request.side));
            }
            if size.is_zero() {
                debug!(account = %self.account, %oid, "Paper trigger dropped, nothing to reduce");
                continue;
            }
            let pnl = state.apply_fill(&request.coin, request.side, size, fill_px, oid);
            info!(
                account = %self.account,
                coin = %request.coin,
                %oid,
                price = %fill_px,
                closed_pnl = %pnl,
                "Paper trigger filled"
            );
        }
    }

    fn query_failure(&self, op: PaperOp) -> ExchangeResult<()> {
        match self.enter(op) {
            Some(message) => Err(ExchangeError::Http(message)),
            None => Ok(()),
        }
    }

    fn cancel(&self, coin: &str, oid: OrderId) -> ExchangeResult<()> {
        self.calls.lock().push(PaperCall::Cancel {
            coin: coin.to_string(),
            oid,
        });
        if let Some(message) = self.enter(PaperOp::Cancel) {
            return Err(ExchangeError::Rejected(message));
        }

        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);
        match state.orders.remove(&oid) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::Rejected(CANCEL_MISSING.to_string())),
        }
    }

    fn leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> ExchangeResult<()> {
        self.calls.lock().push(PaperCall::Leverage {
            coin: coin.to_string(),
            leverage,
            is_cross,
        });
        match self.enter(PaperOp::Leverage) {
            Some(message) => Err(ExchangeError::Rejected(message)),
            None => Ok(()),
        }
    }

    fn equity(&self) -> ExchangeResult<Decimal> {
        self.query_failure(PaperOp::Equity)?;
        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);

        let unrealized: Decimal = state
            .positions
            .iter()
            .filter_map(|(coin, p)| {
                let mid = self.market.mid(coin)?;
                Some((mid.inner() - p.entry_px) * p.szi)
            })
            .sum();
        Ok(state.cash + unrealized)
    }

    fn positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        self.query_failure(PaperOp::Positions)?;
        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);

        Ok(state
            .positions
            .iter()
            .map(|(coin, p)| ExchangePosition {
                coin: coin.clone(),
                szi: p.szi,
                entry_px: Some(Price::new(p.entry_px)),
                unrealized_pnl: self
                    .market
                    .mid(coin)
                    .map_or(Decimal::ZERO, |mid| (mid.inner() - p.entry_px) * p.szi),
            })
            .collect())
    }

    fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
        self.query_failure(PaperOp::OpenOrders)?;
        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);

        Ok(state
            .orders
            .iter()
            .map(|(oid, request)| OpenOrder {
                coin: request.coin.clone(),
                oid: *oid,
                side: request.side,
                size: request.size,
                limit_px: request.limit_px,
                is_trigger: request.kind.is_trigger(),
            })
            .collect())
    }

    fn fills(&self) -> ExchangeResult<Vec<Fill>> {
        self.query_failure(PaperOp::Fills)?;
        let mut state = self.state.lock();
        self.evaluate_triggers(&mut state);
        Ok(state.fills.clone())
    }

    fn mid(&self, coin: &str) -> ExchangeResult<Option<Price>> {
        self.query_failure(PaperOp::Mid)?;
        Ok(self.market.mid(coin))
    }
}

impl ExchangeClient for PaperExchange {
    fn account(&self) -> &str {
        &self.account
    }

    fn place_order(&self, request: OrderRequest) -> BoxFuture<'_, ExchangeResult<OrderResponse>> {
        let response = self.place(request);
        Box::pin(std::future::ready(Ok(response)))
    }

    fn cancel_order<'a>(
        &'a self,
        coin: &'a str,
        oid: OrderId,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(std::future::ready(self.cancel(coin, oid)))
    }

    fn update_leverage<'a>(
        &'a self,
        coin: &'a str,
        leverage: u32,
        is_cross: bool,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(std::future::ready(self.leverage(coin, leverage, is_cross)))
    }

    fn get_equity(&self) -> BoxFuture<'_, ExchangeResult<Decimal>> {
        Box::pin(std::future::ready(self.equity()))
    }

    fn get_open_positions(&self) -> BoxFuture<'_, ExchangeResult<Vec<ExchangePosition>>> {
        Box::pin(std::future::ready(self.positions()))
    }

    fn get_open_orders(&self) -> BoxFuture<'_, ExchangeResult<Vec<OpenOrder>>> {
        Box::pin(std::future::ready(self.open_orders()))
    }

    fn get_fills(&self) -> BoxFuture<'_, ExchangeResult<Vec<Fill>>> {
        Box::pin(std::future::ready(self.fills()))
    }

    fn get_mid_price<'a>(&'a self, coin: &'a str) -> BoxFuture<'a, ExchangeResult<Option<Price>>> {
        Box::pin(std::future::ready(self.mid(coin)))
    }

    fn sz_decimals(&self, coin: &str) -> Option<u32> {
        self.market.sz_decimals(coin)
    }
}

// ============================================================================
// Session factory
// ============================================================================

/// Hands out one `PaperExchange` per subscriber, all on the same market.
pub struct PaperSessionFactory {
    market: Arc<PaperMarket>,
    initial_equity: Decimal,
    accounts: DashMap<SubscriberId, Arc<PaperExchange>>,
    connects: AtomicUsize,
}

impl PaperSessionFactory {
    pub fn new(market: Arc<PaperMarket>, initial_equity: Decimal) -> Self {
        Self {
            market,
            initial_equity,
            accounts: DashMap::new(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn market(&self) -> &Arc<PaperMarket> {
        &self.market
    }

    /// Paper account for the subscriber, created on first access.
    pub fn account(&self, subscriber: &Subscriber) -> Arc<PaperExchange> {
        let entry = self.accounts.entry(subscriber.id).or_insert_with(|| {
            let name = subscriber
                .wallet_address
                .clone()
                .unwrap_or_else(|| subscriber.short_key());
            Arc::new(PaperExchange::new(
                name,
                Arc::clone(&self.market),
                self.initial_equity,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Number of sessions handed out.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl SessionFactory for PaperSessionFactory {
    fn connect(
        &self,
        subscriber: &Subscriber,
        _key: SecretKey,
    ) -> ExchangeResult<DynExchangeClient> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let exchange: DynExchangeClient = self.account(subscriber);
        Ok(exchange)
    }
}
