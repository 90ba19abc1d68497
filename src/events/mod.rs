use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::{OrderStatus, PaymentProvider, PaymentStatus, RefundStatus};
use crate::notifications::{Notification, NotificationSender, NotificationType};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes after a committed write. A closed bus is logged, never surfaced.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "event bus unavailable; event dropped");
        }
    }
}

/// Domain events published after the corresponding write has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        customer_id: Uuid,
        order_number: String,
        total_amount: Decimal,
        currency: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        customer_id: Uuid,
        order_number: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        order_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    RefundStatusChanged {
        refund_id: Uuid,
        payment_id: Uuid,
        customer_id: Uuid,
        amount: Decimal,
        currency: String,
        status: RefundStatus,
    },
    ReconciliationConflict {
        provider: PaymentProvider,
        external_id: String,
        recorded: String,
        reported: String,
    },
}

/// Drains the event bus, turning domain events into notifications.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    notifier: Arc<dyn NotificationSender>,
) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(?event, "Received event");

        let notification = match event {
            Event::OrderCreated {
                customer_id,
                order_number,
                total_amount,
                currency,
                ..
            } => Some(Notification::new(
                customer_id,
                NotificationType::OrderConfirmation,
                format!("Order {} received", order_number),
                format!(
                    "Thanks for your order. We received {} for a total of {} {}.",
                    order_number, total_amount, currency
                ),
            )),
            Event::OrderStatusChanged {
                customer_id,
                order_number,
                to,
                ..
            } => Some(Notification::new(
                customer_id,
                NotificationType::OrderStatus,
                format!("Order {} is now {}", order_number, to),
                format!("Your order {} changed status to {}.", order_number, to),
            )),
            Event::RefundStatusChanged {
                customer_id,
                amount,
                currency,
                status: RefundStatus::Succeeded,
                ..
            } => Some(Notification::new(
                customer_id,
                NotificationType::RefundIssued,
                "Refund issued",
                format!("A refund of {} {} has been issued.", amount, currency),
            )),
            Event::RefundStatusChanged { .. } | Event::PaymentStatusChanged { .. } => None,
            Event::ReconciliationConflict {
                provider,
                external_id,
                recorded,
                reported,
            } => {
                error!(
                    %provider,
                    %external_id,
                    %recorded,
                    %reported,
                    "reconciliation conflict awaiting manual review"
                );
                None
            }
        };

        if let Some(notification) = notification {
            let notification_id = notification.id;
            if let Err(e) = notifier.send(notification).await {
                error!(%notification_id, error = %e, "Failed to send notification");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Notification>>);

    #[async_trait]
    impl NotificationSender for Recording {
        async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
            self.0.lock().unwrap().push(notification);
            Ok(())
        }
    }

    #[tokio::test]
    async fn order_created_sends_confirmation() {
        let (tx, rx) = mpsc::channel(8);
        let recording = Arc::new(Recording::default());
        let sender = EventSender::new(tx);

        let customer_id = Uuid::new_v4();
        sender
            .send(Event::OrderCreated {
                order_id: Uuid::new_v4(),
                customer_id,
                order_number: "ORD-1".into(),
                total_amount: Decimal::new(5000, 2),
                currency: "USD".into(),
            })
            .await
            .unwrap();
        drop(sender);

        process_events(rx, recording.clone()).await;

        let sent = recording.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].customer_id, customer_id);
        assert_eq!(sent[0].notification_type, NotificationType::OrderConfirmation);
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_bus() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx)
            .send_or_log(Event::ReconciliationConflict {
                provider: PaymentProvider::Stripe,
                external_id: "pi_1".into(),
                recorded: "succeeded".into(),
                reported: "failed".into(),
            })
            .await;
    }
}
