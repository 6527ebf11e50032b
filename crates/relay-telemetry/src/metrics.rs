//! Prometheus metrics for the signal relay.
//!
//! Covers:
//! - Signal broadcast and delivery outcomes
//! - Bracket placement per leg, including emergency closes
//! - Position closes and fill ingestion
//! - Loop tick latency and loop-level errors
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, register_int_gauge, Counter,
    CounterVec, Encoder, HistogramVec, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Signals broadcast.
pub static SIGNALS_BROADCAST_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("relay_signals_broadcast_total", "Total signals broadcast").unwrap()
});

/// Delivery outcomes.
/// Labels: outcome (executed/failed/skipped/expired/claim_lost)
pub static DELIVERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_deliveries_total",
        "Signal deliveries processed by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Bracket executor outcomes.
/// Labels: outcome (opened/skipped/rejected/failed)
pub static BRACKET_OUTCOME_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_bracket_outcome_total",
        "Bracket execution outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Individual order attempts.
/// Labels: leg (entry/tp/sl/cancel), result (ok/error)
pub static ORDER_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_order_attempts_total",
        "Order placement attempts by leg and result",
        &["leg", "result"]
    )
    .unwrap()
});

/// Emergency close results.
pub static EMERGENCY_CLOSE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_emergency_close_total",
        "Emergency close attempts after partial brackets",
        &["result"]
    )
    .unwrap()
});

/// Positions leaving the open state.
pub static POSITIONS_CLOSED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_positions_closed_total",
        "Positions closed by resulting status and exit type",
        &["status", "exit_type"]
    )
    .unwrap()
});

/// Newly stored fills.
pub static FILLS_INGESTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("relay_fills_ingested_total", "New exchange fills stored").unwrap()
});

/// Loop-level errors.
pub static LOOP_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "relay_loop_errors_total",
        "Unhandled errors per background loop",
        &["loop"]
    )
    .unwrap()
});

/// Duration of one loop tick in seconds.
pub static LOOP_TICK_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "relay_loop_tick_seconds",
        "Duration of one loop tick",
        &["loop"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

/// Positions currently tracked as open.
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("relay_open_positions", "Open positions under monitoring").unwrap()
});

/// Typed metric updates.
pub struct Metrics;

impl Metrics {
    pub fn signal_broadcast() {
        SIGNALS_BROADCAST_TOTAL.inc();
    }

    pub fn delivery(outcome: &str) {
        DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn bracket_outcome(outcome: &str) {
        BRACKET_OUTCOME_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record one order attempt for a bracket leg.
    pub fn order_attempt(leg: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        ORDER_ATTEMPTS_TOTAL.with_label_values(&[leg, result]).inc();
    }

    pub fn emergency_close(success: bool) {
        let result = if success { "success" } else { "failure" };
        EMERGENCY_CLOSE_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn position_closed(status: &str, exit_type: &str) {
        POSITIONS_CLOSED_TOTAL
            .with_label_values(&[status, exit_type])
            .inc();
    }

    pub fn fills_ingested(count: u64) {
        FILLS_INGESTED_TOTAL.inc_by(count as f64);
    }

    pub fn loop_error(name: &str) {
        LOOP_ERRORS_TOTAL.with_label_values(&[name]).inc();
    }

    pub fn loop_tick(name: &str, seconds: f64) {
        LOOP_TICK_SECONDS.with_label_values(&[name]).observe(seconds);
    }

    pub fn open_positions(count: usize) {
        OPEN_POSITIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Render the default registry in the Prometheus text format.
    ///
    /// # Errors
    /// `TelemetryError::Metrics` if encoding fails.
    pub fn render() -> TelemetryResult<String> {
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
