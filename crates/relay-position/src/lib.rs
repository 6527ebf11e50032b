//! Position reconciliation for the signal relay.
//!
//! Watches every open bracket until the exchange reports it flat, then
//! decides how it closed and records the round trip.
//!
//! - [`classifier`]: which leg fired
//! - [`matcher`]: whether the position traces back to a broadcast signal
//! - [`pnl`]: exchange vs. price-delta P&L
//! - [`monitor`]: the reconciliation loop

pub mod classifier;
pub mod error;
pub mod matcher;
pub mod monitor;
pub mod pnl;

pub use classifier::{
    ClassifierKind, CloseEvidence, DynExitClassifier, ExitClassifier, OrderPresence,
    PriceProximity,
};
pub use error::{PositionError, PositionResult};
pub use matcher::SignalMatcher;
pub use monitor::{CheckOutcome, MonitorConfig, MonitorSummary, PositionMonitor};
pub use pnl::{
    calculated_pnl, exchange_pnl, last_exit_price, profit_percent, ExchangePnl, PnlPolicy,
    ResolvedPnl,
};
