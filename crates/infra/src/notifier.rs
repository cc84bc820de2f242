//! Outbound notification collaborator (email/SMS/push gateways).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use labflow_core::UserId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifierError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingNotification {
    pub notification_id: String,
    pub user_id: UserId,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &OutgoingNotification) -> Result<DeliveryReceipt, NotifierError>;
}

/// Recording notifier for tests/dev. Failures can be scripted ahead of time.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<OutgoingNotification>>,
    scripted: Mutex<Vec<NotifierError>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        let mut scripted = self.scripted.lock();
        for _ in 0..n {
            scripted.push(NotifierError::Unavailable("scripted outage".to_string()));
        }
    }

    /// Fail the next send with `error`, after any already scripted failures.
    pub fn fail_with(&self, error: NotifierError) {
        self.scripted.lock().push(error);
    }

    pub fn sent(&self) -> Vec<OutgoingNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, notification: &OutgoingNotification) -> Result<DeliveryReceipt, NotifierError> {
        {
            let mut scripted = self.scripted.lock();
            if !scripted.is_empty() {
                return Err(scripted.remove(0));
            }
        }
        if notification.recipient.trim().is_empty() {
            return Err(NotifierError::InvalidRecipient("empty recipient".to_string()));
        }
        self.sent.lock().push(notification.clone());
        Ok(DeliveryReceipt {
            provider_id: format!("mem-{}", notification.notification_id),
            accepted_at: Utc::now(),
        })
    }
}

/// Notifier that only logs; the default when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &OutgoingNotification) -> Result<DeliveryReceipt, NotifierError> {
        if notification.recipient.trim().is_empty() {
            return Err(NotifierError::InvalidRecipient("empty recipient".to_string()));
        }
        tracing::info!(
            notification_id = %notification.notification_id,
            channel = ?notification.channel,
            recipient = %notification.recipient,
            "notification dispatched"
        );
        Ok(DeliveryReceipt {
            provider_id: format!("log-{}", notification.notification_id),
            accepted_at: Utc::now(),
        })
    }
}
