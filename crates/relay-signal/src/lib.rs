//! Signal store protocol.
//!
//! The operations the HTTP layer exposes to the broadcaster and to
//! subscriber agents: submit a signal, poll the latest undelivered one,
//! acknowledge and confirm execution, mark/list/retry failures, and the
//! reporting queries over positions and the trade ledger.

pub mod error;
pub mod service;
pub mod types;

pub use error::{SignalError, SignalResult};
pub use service::{SignalService, DEFAULT_EXPIRY_MINUTES, DEFAULT_FAILED_LIMIT};
pub use types::{BroadcastReceipt, ConfirmOutcome, LatestSignal, LedgerSummary};
