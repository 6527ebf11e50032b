//! Core domain types for the signal relay.
//!
//! This crate provides the types shared by every other crate:
//! - `Price`, `Size`: Precision-safe numeric types with exchange rounding
//! - `Signal`, `SignalAction`: Broadcast trade instructions
//! - `Delivery`, `DeliveryState`: Per-subscriber delivery state machine
//! - `Subscriber`: Account that follows the signal source
//! - `OpenPosition`, `Trade`: Live brackets and the closed-trade ledger
//! - `Fill`: Raw exchange execution used for P&L and audit
//! - `OrderSide`, `OrderKind`, `OrderId`: Order enums and identifiers

pub mod decimal;
pub mod delivery;
pub mod error;
pub mod fill;
pub mod order;
pub mod position;
pub mod signal;
pub mod subscriber;
pub mod symbol;

pub use decimal::{Price, Size, PRICE_SIG_FIGS};
pub use delivery::{Delivery, DeliveryId, DeliveryState, DeliveryStateKind, EXPIRED_REASON};
pub use error::{CoreError, Result};
pub use fill::Fill;
pub use order::{OrderId, OrderKind, OrderSide, TimeInForce, TpSl};
pub use position::{
    ExitType, NewOpenPosition, NewTrade, OpenPosition, PnlSource, PositionId, PositionStatus,
    Trade,
};
pub use signal::{NewSignal, Signal, SignalAction, SignalId};
pub use subscriber::{Subscriber, SubscriberId, SubscriberStats};
pub use symbol::{base_symbol, to_exchange_coin};
