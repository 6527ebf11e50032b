//! Bounded retry with exponential backoff.
//!
//! Applied uniformly to entry, take-profit and stop-loss placement and to
//! order cancellation. Backoff sleeps happen only between attempts, never
//! after the last one.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use relay_core::OrderId;
use relay_exchange::{
    DynExchangeClient, ExchangeError, ExchangeResult, OrderRequest, PlacedOrder,
};
use relay_telemetry::Metrics;

// ============================================================================
// Policy
// ============================================================================

/// Retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): initial × 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or the attempt cap is reached.
    ///
    /// # Errors
    /// `RetryFailure` with one entry per failed attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut errors = Vec::new();

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    errors.push(AttemptError {
                        attempt,
                        error: e.to_string(),
                    });
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(RetryFailure {
            operation: operation.to_string(),
            errors,
        })
    }
}

// ============================================================================
// Failure
// ============================================================================

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub attempt: u32,
    pub error: String,
}

/// Definitive failure after the attempt cap, with the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub operation: String,
    pub errors: Vec<AttemptError>,
}

impl RetryFailure {
    pub fn attempts(&self) -> usize {
        self.errors.len()
    }

    pub fn last_error(&self) -> &str {
        self.errors.last().map_or("", |e| e.error.as_str())
    }

    /// Multi-line attempt log for alerts.
    pub fn attempt_log(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("Attempt {}: {}", e.attempt, e.error))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempts: {}",
            self.operation,
            self.attempts(),
            self.last_error()
        )
    }
}

impl std::error::Error for RetryFailure {}

// ============================================================================
// Order operations
// ============================================================================

/// Bracket leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Entry,
    TakeProfit,
    StopLoss,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::TakeProfit => "tp",
            Self::StopLoss => "sl",
        }
    }

    /// Label used in alerts ("TP order failed ...").
    pub fn label(&self) -> &'static str {
        match self {
            Self::Entry => "Entry",
            Self::TakeProfit => "TP",
            Self::StopLoss => "SL",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Place one bracket leg with retry.
///
/// The entry leg only counts as placed when it filled; an IOC that rests
/// or is cancelled is a failed attempt.
pub async fn place_with_retry(
    policy: &RetryPolicy,
    client: &DynExchangeClient,
    request: &OrderRequest,
    leg: Leg,
) -> Result<PlacedOrder, RetryFailure> {
    policy
        .run(leg.as_str(), || {
            let request = request.clone();
            async move {
                let result = client
                    .place_order(request)
                    .await
                    .and_then(|response| response.into_placed())
                    .and_then(|placed| {
                        if leg == Leg::Entry && !placed.is_filled() {
                            Err(ExchangeError::Rejected(
                                "Entry order did not fill".to_string(),
                            ))
                        } else {
                            Ok(placed)
                        }
                    });
                Metrics::order_attempt(leg.as_str(), result.is_ok());
                result
            }
        })
        .await
}

/// Cancel with retry. An order that is already gone counts as cancelled.
pub async fn cancel_with_retry(
    policy: &RetryPolicy,
    client: &DynExchangeClient,
    coin: &str,
    oid: OrderId,
) -> Result<(), RetryFailure> {
    policy
        .run("cancel", || async move {
            match client.cancel_order(coin, oid).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_already_gone() => {
                    debug!(coin, %oid, error = %e, "Order already gone, cancel is a no-op");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
}
