//! Per-subscriber signal delivery.
//!
//! A delivery joins one signal to one subscriber and carries an explicit
//! state machine:
//!
//! ```text
//! Pending ──claim/acknowledge/confirm──► AcknowledgedExecuted
//!    │                                        │
//!    └──────fail/expire──► AcknowledgedFailed ◄┘ fail
//!                               │
//!                               └──reset──► Pending
//! ```
//!
//! Acknowledgment is recorded before any order is sent, so a crash between
//! claim and execution can never cause a second execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::signal::SignalId;
use crate::subscriber::SubscriberId;
use crate::Price;

/// Delivery primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub i64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reason recorded when a delivery expires unexecuted.
pub const EXPIRED_REASON: &str = "signal expired";

// ============================================================================
// State
// ============================================================================

/// Delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Not yet picked up.
    Pending,
    /// Acknowledged; execution started or confirmed.
    AcknowledgedExecuted {
        acknowledged_at: DateTime<Utc>,
        /// Set once execution is confirmed.
        executed_at: Option<DateTime<Utc>>,
        execution_price: Option<Price>,
    },
    /// Acknowledged but failed; retryable by an explicit reset.
    AcknowledgedFailed {
        acknowledged_at: DateTime<Utc>,
        reason: String,
    },
}

/// Discriminant of `DeliveryState`, used for compare-and-set updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStateKind {
    Pending,
    AcknowledgedExecuted,
    AcknowledgedFailed,
}

impl DeliveryStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AcknowledgedExecuted => "acknowledged_executed",
            Self::AcknowledgedFailed => "acknowledged_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "acknowledged_executed" => Some(Self::AcknowledgedExecuted),
            "acknowledged_failed" => Some(Self::AcknowledgedFailed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeliveryState {
    pub fn kind(&self) -> DeliveryStateKind {
        match self {
            Self::Pending => DeliveryStateKind::Pending,
            Self::AcknowledgedExecuted { .. } => DeliveryStateKind::AcknowledgedExecuted,
            Self::AcknowledgedFailed { .. } => DeliveryStateKind::AcknowledgedFailed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::AcknowledgedFailed { .. })
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            Self::AcknowledgedExecuted {
                executed_at: Some(_),
                ..
            }
        )
    }

    pub fn acknowledged_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::AcknowledgedExecuted {
                acknowledged_at, ..
            }
            | Self::AcknowledgedFailed {
                acknowledged_at, ..
            } => Some(*acknowledged_at),
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::AcknowledgedFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Early acknowledgment by the trading loop, before any order is sent.
    pub fn claim(&self, at: DateTime<Utc>) -> Result<Self> {
        match self {
            Self::Pending => Ok(Self::AcknowledgedExecuted {
                acknowledged_at: at,
                executed_at: None,
                execution_price: None,
            }),
            other => Err(invalid(other, "claim")),
        }
    }

    /// Receipt acknowledgment from an agent. Repeating it is a no-op.
    pub fn acknowledge(&self, at: DateTime<Utc>) -> Result<Self> {
        match self {
            Self::Pending => self.claim(at),
            Self::AcknowledgedExecuted { .. } => Ok(self.clone()),
            other => Err(invalid(other, "acknowledge")),
        }
    }

    /// Record confirmed execution.
    pub fn confirm(&self, at: DateTime<Utc>, price: Option<Price>) -> Result<Self> {
        match self {
            Self::Pending => Ok(Self::AcknowledgedExecuted {
                acknowledged_at: at,
                executed_at: Some(at),
                execution_price: price,
            }),
            Self::AcknowledgedExecuted {
                acknowledged_at,
                execution_price,
                ..
            } => Ok(Self::AcknowledgedExecuted {
                acknowledged_at: *acknowledged_at,
                executed_at: Some(at),
                execution_price: price.or(*execution_price),
            }),
            other => Err(invalid(other, "confirm")),
        }
    }

    /// Mark the delivery failed with a human-readable reason.
    pub fn fail(&self, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::AcknowledgedFailed {
            acknowledged_at: self.acknowledged_at().unwrap_or(at),
            reason: reason.into(),
        }
    }

    /// Retire a pending delivery whose signal aged out.
    pub fn expire(&self, at: DateTime<Utc>) -> Result<Self> {
        match self {
            Self::Pending => Ok(Self::AcknowledgedFailed {
                acknowledged_at: at,
                reason: EXPIRED_REASON.to_string(),
            }),
            other => Err(invalid(other, "expire")),
        }
    }

    /// Operator retry: put a failed delivery back in the queue.
    pub fn reset(&self) -> Result<Self> {
        match self {
            Self::AcknowledgedFailed { .. } => Ok(Self::Pending),
            other => Err(invalid(other, "reset")),
        }
    }
}

fn invalid(state: &DeliveryState, action: &'static str) -> CoreError {
    CoreError::InvalidTransition {
        from: state.kind(),
        action,
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Delivery row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub signal_id: SignalId,
    pub subscriber_id: SubscriberId,
    pub delivered_at: DateTime<Utc>,
    pub state: DeliveryState,
    /// Number of times this delivery has been marked failed.
    pub retry_count: u32,
}

impl Delivery {
    #[must_use]
    pub fn new(
        id: DeliveryId,
        signal_id: SignalId,
        subscriber_id: SubscriberId,
        delivered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            signal_id,
            subscriber_id,
            delivered_at,
            state: DeliveryState::Pending,
            retry_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_claim_only_from_pending() {
        let now = Utc::now();
        let claimed = DeliveryState::Pending.claim(now).unwrap();

        assert_eq!(claimed.kind(), DeliveryStateKind::AcknowledgedExecuted);
        assert!(!claimed.is_confirmed());
        assert!(claimed.claim(now).is_err());
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let now = Utc::now();
        let acked = DeliveryState::Pending.acknowledge(now).unwrap();
        assert_eq!(acked.acknowledge(now).unwrap(), acked);
    }

    #[test]
    fn test_confirm_keeps_ack_time_and_price() {
        let acked_at = Utc::now();
        let confirmed_at = acked_at + chrono::Duration::seconds(3);
        let claimed = DeliveryState::Pending.claim(acked_at).unwrap();

        let confirmed = claimed
            .confirm(confirmed_at, Some(Price::new(dec!(0.5012))))
            .unwrap();
        assert!(confirmed.is_confirmed());
        assert_eq!(confirmed.acknowledged_at(), Some(acked_at));

        let again = confirmed.confirm(confirmed_at, None).unwrap();
        assert!(matches!(
            again,
            DeliveryState::AcknowledgedExecuted {
                execution_price: Some(p),
                ..
            } if p.0 == dec!(0.5012)
        ));
    }

    #[test]
    fn test_fail_and_reset() {
        let now = Utc::now();
        let failed = DeliveryState::Pending
            .claim(now)
            .unwrap()
            .fail(now, "Entry order failed");

        assert!(failed.is_failed());
        assert_eq!(failed.failure_reason(), Some("Entry order failed"));
        assert!(failed.confirm(now, None).is_err());
        assert_eq!(failed.reset().unwrap(), DeliveryState::Pending);
        assert!(DeliveryState::Pending.reset().is_err());
    }

    #[test]
    fn test_expire_records_reason() {
        let expired = DeliveryState::Pending.expire(Utc::now()).unwrap();
        assert_eq!(expired.failure_reason(), Some(EXPIRED_REASON));
    }

    #[test]
    fn test_state_kind_round_trip_names() {
        for kind in [
            DeliveryStateKind::Pending,
            DeliveryStateKind::AcknowledgedExecuted,
            DeliveryStateKind::AcknowledgedFailed,
        ] {
            assert_eq!(DeliveryStateKind::parse(kind.as_str()), Some(kind));
        }
    }
}
