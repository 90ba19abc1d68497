use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Represents a customer-facing notification
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub customer_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        customer_id: Uuid,
        notification_type: NotificationType,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            notification_type,
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderConfirmation,
    OrderStatus,
    RefundIssued,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outbound customer messaging. Delivery is fire-and-forget: callers log
/// failures and never roll back the business operation that triggered them.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the structured log. Used until a mail transport is wired in.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        info!(
            notification_id = %notification.id,
            customer_id = %notification.customer_id,
            kind = ?notification.notification_type,
            subject = %notification.subject,
            "notification dispatched"
        );
        Ok(())
    }
}
