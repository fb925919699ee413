//! Outbound notifications for online/offline transitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_proto::ResourceKind;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    Online,
    Offline,
    /// Back online after an alert fired
    Recovered { downtime_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: ResourceKind,
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn summary(&self) -> String {
        match &self.event {
            NotificationEvent::Online => format!("{} {} is online", self.kind, self.name),
            NotificationEvent::Offline => format!("{} {} went offline", self.kind, self.name),
            NotificationEvent::Recovered { downtime_secs } => format!(
                "{} {} recovered after {}s offline",
                self.kind, self.name, downtime_secs
            ),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.event {
            NotificationEvent::Offline => warn!(
                kind = %notification.kind,
                id = %notification.id,
                "{}",
                notification.summary()
            ),
            _ => info!(
                kind = %notification.kind,
                id = %notification.id,
                "{}",
                notification.summary()
            ),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "text": notification.summary(),
                "notification": notification,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
