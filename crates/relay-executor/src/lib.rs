//! Bracket execution for the signal relay.
//!
//! - [`retry`]: bounded exponential retry and idempotent cancel
//! - [`sizing`]: signal validation and risk-based quantity
//! - [`gate`]: one-position-per-subscriber safety gate
//! - [`bracket`]: entry, TP and SL placement with emergency unwind
//! - [`batch`]: shuffled, bounded fan-out
//! - [`trading_loop`]: the polling scheduler

pub mod alerts;
pub mod batch;
pub mod bracket;
pub mod error;
pub mod gate;
pub mod retry;
pub mod sizing;
pub mod trading_loop;

pub use batch::{run_in_batches, BatchConfig, BatchStats};
pub use bracket::{BracketConfig, BracketExecutor, BracketOutcome};
pub use error::{ExecutorError, ExecutorResult};
pub use gate::{GateDecision, SafetyGate};
pub use retry::{cancel_with_retry, place_with_retry, Leg, RetryFailure, RetryPolicy};
pub use sizing::{size_position, validate_signal, BracketTargets, PositionSize, SignalRejection};
pub use trading_loop::{TickSummary, TradingLoop, TradingLoopConfig};
