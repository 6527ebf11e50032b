//! Exchange access for the signal relay.
//!
//! The engine never talks to an exchange SDK directly. Everything goes through
//! the `ExchangeClient` trait, one client per subscriber account.
//!
//! # Key Components
//!
//! - [`ExchangeClient`]: Order placement, cancellation and account queries
//! - [`OrderResponse`]: Tagged placement result (`Filled` / `Resting` / `Error`)
//! - [`CredentialStore`]: Decrypts subscriber credentials into a [`SecretKey`]
//! - [`SessionCache`]: Per-subscriber client cache, populated lazily
//! - [`PaperExchange`]: Simulated account used for paper trading and tests
//! - [`InfoClient`]: Read-only market data (mids, size decimals) over REST

pub mod client;
pub mod credentials;
pub mod error;
pub mod info;
pub mod paper;
pub mod session;

pub use client::{
    BoxFuture, DynExchangeClient, ExchangeClient, ExchangePosition, OpenOrder, OrderRequest,
    OrderResponse, PlacedOrder,
};
pub use credentials::{CredentialStore, DynCredentialStore, HexKeyCredentialStore, SecretKey};
pub use error::{ExchangeError, ExchangeResult};
pub use info::{InfoClient, DEFAULT_INFO_URL};
pub use paper::{PaperCall, PaperExchange, PaperMarket, PaperOp, PaperSessionFactory};
pub use session::{DynSessionFactory, SessionCache, SessionFactory};
