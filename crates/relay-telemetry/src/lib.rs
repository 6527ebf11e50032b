//! Observability for the signal relay.
//!
//! - Prometheus metrics for broadcasts, deliveries, brackets and loop health
//! - Structured logging with tracing (pretty in development, JSON in production)
//! - Operator notifications through the `Notifier` trait

pub mod error;
pub mod logging;
pub mod metrics;
pub mod notify;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
pub use notify::{
    DynNotifier, EmailConfig, EmailNotifier, LogNotifier, Notification, Notifier,
    RecordingNotifier, Severity,
};
