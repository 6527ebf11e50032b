//! Operator notifications.
//!
//! Alerts are fire-and-forget: a notifier never returns an error to the
//! caller. Delivery problems are logged and the trading path continues.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default timeout for notification requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Success,
}

impl Severity {
    /// Subject prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One alert as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub details: String,
}

impl Notification {
    /// Subject line: `[CRITICAL] Bracket Order Incomplete`.
    pub fn subject(&self) -> String {
        format!("[{}] {}", self.severity.prefix(), self.title)
    }
}

/// Operator alert sink.
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        severity: Severity,
        title: &'a str,
        details: &'a str,
    ) -> BoxFuture<'a, ()>;
}

pub type DynNotifier = Arc<dyn Notifier>;

// ============================================================================
// Log
// ============================================================================

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        severity: Severity,
        title: &'a str,
        details: &'a str,
    ) -> BoxFuture<'a, ()> {
        match severity {
            Severity::Critical => error!(%title, %details, "Operator alert"),
            Severity::Warning => warn!(%title, %details, "Operator alert"),
            Severity::Info | Severity::Success => info!(%title, %details, "Operator alert"),
        }
        Box::pin(std::future::ready(()))
    }
}

// ============================================================================
// Email
// ============================================================================

/// Settings for the transactional email API.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Endpoint accepting `{from, to, subject, text}`.
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
}

/// Sends alerts through a Resend-compatible HTTP API.
pub struct EmailNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl EmailNotifier {
    /// # Errors
    /// `TelemetryError::Notifier` if the HTTP client cannot be built.
    pub fn new(config: EmailConfig) -> crate::TelemetryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| {
                crate::TelemetryError::Notifier(format!("Failed to create HTTP client: {e}"))
            })?;
        Ok(Self { config, client })
    }

    async fn send(&self, notification: Notification) {
        let payload = EmailPayload {
            from: &self.config.from,
            to: vec![self.config.to.as_str()],
            subject: notification.subject(),
            text: notification.details.clone(),
        };

        let result = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(subject = %payload.subject, "Alert email sent");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(subject = %payload.subject, %status, %body, "Alert email rejected");
            }
            Err(e) => {
                error!(subject = %payload.subject, error = %e, "Alert email failed");
            }
        }
    }
}

impl Notifier for EmailNotifier {
    fn notify<'a>(
        &'a self,
        severity: Severity,
        title: &'a str,
        details: &'a str,
    ) -> BoxFuture<'a, ()> {
        let notification = Notification {
            severity,
            title: title.to_string(),
            details: details.to_string(),
        };
        Box::pin(self.send(notification))
    }
}

// ============================================================================
// Recording
// ============================================================================

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.title.clone()).collect()
    }

    /// First alert with the given title.
    pub fn find(&self, title: &str) -> Option<Notification> {
        self.sent.lock().iter().find(|n| n.title == title).cloned()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(
        &'a self,
        severity: Severity,
        title: &'a str,
        details: &'a str,
    ) -> BoxFuture<'a, ()> {
        self.sent.lock().push(Notification {
            severity,
            title: title.to_string(),
            details: details.to_string(),
        });
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_prefix() {
        let n = Notification {
            severity: Severity::Critical,
            title: "Bracket Order Incomplete".to_string(),
            details: String::new(),
        };
        assert_eq!(n.subject(), "[CRITICAL] Bracket Order Incomplete");
        assert_eq!(Severity::Success.prefix(), "SUCCESS");
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify(Severity::Warning, "Failed to Cancel TP", "oid 12")
            .await;
        notifier.notify(Severity::Info, "Heartbeat", "ok").await;

        assert_eq!(notifier.titles(), vec!["Failed to Cancel TP", "Heartbeat"]);
        let found = notifier.find("Failed to Cancel TP").unwrap();
        assert_eq!(found.severity, Severity::Warning);
        assert_eq!(found.details, "oid 12");
    }

    #[tokio::test]
    async fn test_email_failure_is_swallowed() {
        let notifier = EmailNotifier::new(EmailConfig {
            api_url: "http://127.0.0.1:9/emails".to_string(),
            api_key: "re_test".to_string(),
            from: "alerts@relay.local".to_string(),
            to: "ops@relay.local".to_string(),
        })
        .unwrap();

        notifier.notify(Severity::Critical, "Test", "unreachable").await;
    }

    #[test]
    fn test_email_payload_shape() {
        let payload = EmailPayload {
            from: "a@x",
            to: vec!["b@x"],
            subject: "[INFO] t".to_string(),
            text: "body".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["to"][0], "b@x");
        assert_eq!(json["subject"], "[INFO] t");
    }
}
