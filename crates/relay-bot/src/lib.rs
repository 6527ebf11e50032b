//! Signal relay application.
//!
//! Wires the shared store, the exchange sessions and the notifier into the
//! two control loops:
//! - trading loop: pending deliveries become bracket orders
//! - position monitor: closed brackets become ledger entries

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
