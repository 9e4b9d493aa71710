//! Out-of-band operator alerts for unhandled faults.
//!
//! The recovery middleware hands every caught fault to an [`AlertSink`].
//! Delivery happens on a background task after the HTTP response has been
//! produced, so a slow or broken sink never affects the caller.
//!
//! # Sinks
//!
//! - [`LogAlertSink`] - writes the alert to the log (default)
//! - [`WebhookAlertSink`] - POSTs the alert as JSON (`ALERT_WEBHOOK_URL`)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Alert describing one caught fault.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Alert {
    /// Short human-readable subject line.
    pub subject: String,
    /// Fault message (panic payload).
    pub message: String,
    /// Unix timestamp (seconds) when the fault was caught.
    pub timestamp: i64,
    /// Request id of the failing request, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Request path of the failing request.
    pub path: String,
}

impl Alert {
    /// Build an alert stamped with the current time.
    pub fn new(message: impl Into<String>, path: impl Into<String>, request_id: Option<String>) -> Self {
        let timestamp = Utc::now().timestamp();
        Self {
            subject: format!("Unhandled fault at {timestamp}"),
            message: message.into(),
            timestamp,
            request_id,
            path: path.into(),
        }
    }
}

/// Alert delivery failure.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),

    #[error("alert endpoint rejected alert with status {0}")]
    Rejected(u16),
}

/// Destination for fault alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Sink that only logs. Used when no external destination is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        error!(
            subject = %alert.subject,
            message = %alert.message,
            timestamp = alert.timestamp,
            request_id = ?alert.request_id,
            path = %alert.path,
            "ALERT"
        );
        Ok(())
    }
}

/// Sink that POSTs alerts as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Create a webhook sink with a per-delivery timeout.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Delivery` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
