//! Persistent store for the signal relay.
//!
//! Both control loops share state only through this crate. Every mutation is
//! atomic per row; delivery transitions are compare-and-set on the current
//! state so concurrent claimers never both win.
//!
//! Backends:
//! - [`MemoryStore`]: in-process, used for paper trading and as the test double
//! - [`PgStore`]: PostgreSQL through `sqlx`, schema in `migrations/`

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{BoxFuture, DynStore, Store};
pub use types::{DeliveryWithSignal, ErrorLogEntry, ErrorType, PendingDelivery};
