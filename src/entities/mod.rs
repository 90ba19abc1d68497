pub mod commerce;
pub mod order;
pub mod order_address;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod refund;
pub mod webhook_event;

pub use order::OrderStatus;
pub use payment::{PaymentMethodKind, PaymentProvider, PaymentStatus};
pub use refund::{RefundReason, RefundStatus};
pub use webhook_event::WebhookOutcome;
