//! Exchange client trait.
//!
//! One `ExchangeClient` is bound to one subscriber account. All methods are
//! dyn-compatible so clients can be cached as `Arc<dyn ExchangeClient>` and
//! swapped for the paper implementation in tests.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_core::{Fill, OrderId, OrderKind, OrderSide, Price, Size};

use crate::error::{ExchangeError, ExchangeResult};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Requests and responses
// ============================================================================

/// Order to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub coin: String,
    pub side: OrderSide,
    pub size: Size,
    pub limit_px: Price,
    pub kind: OrderKind,
    pub reduce_only: bool,
}

impl OrderRequest {
    /// Immediate-or-cancel limit order.
    #[must_use]
    pub fn ioc(coin: impl Into<String>, side: OrderSide, size: Size, limit_px: Price) -> Self {
        Self {
            coin: coin.into(),
            side,
            size,
            limit_px,
            kind: OrderKind::ioc(),
            reduce_only: false,
        }
    }

    /// Reduce-only take-profit trigger executing as a limit at the trigger price.
    #[must_use]
    pub fn take_profit(coin: impl Into<String>, side: OrderSide, size: Size, px: Price) -> Self {
        Self {
            coin: coin.into(),
            side,
            size,
            limit_px: px,
            kind: OrderKind::take_profit(px),
            reduce_only: true,
        }
    }

    /// Reduce-only stop-loss trigger executing as a market order.
    #[must_use]
    pub fn stop_loss(coin: impl Into<String>, side: OrderSide, size: Size, px: Price) -> Self {
        Self {
            coin: coin.into(),
            side,
            size,
            limit_px: px,
            kind: OrderKind::stop_loss(px),
            reduce_only: true,
        }
    }

    #[must_use]
    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Placement result as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderResponse {
    /// Executed immediately.
    Filled {
        oid: OrderId,
        avg_px: Price,
        total_sz: Size,
    },
    /// Accepted onto the book (or as a trigger).
    Resting { oid: OrderId },
    /// Accepted by transport but refused by the exchange.
    Error(String),
}

impl OrderResponse {
    pub fn oid(&self) -> Option<OrderId> {
        match self {
            Self::Filled { oid, .. } | Self::Resting { oid } => Some(*oid),
            Self::Error(_) => None,
        }
    }

    /// Convert an exchange-level error into `ExchangeError::Rejected`.
    pub fn into_placed(self) -> ExchangeResult<PlacedOrder> {
        match self {
            Self::Filled {
                oid,
                avg_px,
                total_sz,
            } => Ok(PlacedOrder {
                oid,
                avg_px: Some(avg_px),
                filled_sz: Some(total_sz),
            }),
            Self::Resting { oid } => Ok(PlacedOrder {
                oid,
                avg_px: None,
                filled_sz: None,
            }),
            Self::Error(msg) => Err(ExchangeError::Rejected(msg)),
        }
    }
}

/// Successfully accepted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedOrder {
    pub oid: OrderId,
    /// Present only when the order filled immediately.
    pub avg_px: Option<Price>,
    pub filled_sz: Option<Size>,
}

impl PlacedOrder {
    pub fn is_filled(&self) -> bool {
        self.avg_px.is_some()
    }
}

/// Position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub coin: String,
    /// Signed size; positive is long.
    pub szi: Decimal,
    pub entry_px: Option<Price>,
    pub unrealized_pnl: Decimal,
}

impl ExchangePosition {
    pub fn is_open(&self) -> bool {
        !self.szi.is_zero()
    }
}

/// Resting order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub coin: String,
    pub oid: OrderId,
    pub side: OrderSide,
    pub size: Size,
    pub limit_px: Price,
    pub is_trigger: bool,
}

// ============================================================================
// Trait
// ============================================================================

/// Per-account exchange operations.
pub trait ExchangeClient: Send + Sync {
    /// Account identifier used in logs.
    fn account(&self) -> &str;

    fn place_order(&self, request: OrderRequest) -> BoxFuture<'_, ExchangeResult<OrderResponse>>;

    fn cancel_order<'a>(&'a self, coin: &'a str, oid: OrderId)
        -> BoxFuture<'a, ExchangeResult<()>>;

    fn update_leverage<'a>(
        &'a self,
        coin: &'a str,
        leverage: u32,
        is_cross: bool,
    ) -> BoxFuture<'a, ExchangeResult<()>>;

    /// Account value in USD.
    fn get_equity(&self) -> BoxFuture<'_, ExchangeResult<Decimal>>;

    fn get_open_positions(&self) -> BoxFuture<'_, ExchangeResult<Vec<ExchangePosition>>>;

    fn get_open_orders(&self) -> BoxFuture<'_, ExchangeResult<Vec<OpenOrder>>>;

    /// Recent fills for the account.
    fn get_fills(&self) -> BoxFuture<'_, ExchangeResult<Vec<Fill>>>;

    fn get_mid_price<'a>(&'a self, coin: &'a str) -> BoxFuture<'a, ExchangeResult<Option<Price>>>;

    /// Size decimals for the coin, if known.
    fn sz_decimals(&self, coin: &str) -> Option<u32>;
}

/// Arc wrapper for ExchangeClient trait objects.
pub type DynExchangeClient = Arc<dyn ExchangeClient>;
