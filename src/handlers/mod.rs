pub mod admin;
pub mod cart;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    config::AppConfig,
    entities::PaymentProvider,
    errors::ServiceError,
    events::EventSender,
    services::{
        commerce::{CartService, CatalogService, CheckoutService, CheckoutSettings},
        order_lifecycle::OrderLifecycleService,
        orders::OrderService,
        payments::{GatewayRegistry, PaymentService},
        reconciliation::WebhookReconciler,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub order: Arc<OrderService>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub catalog: Arc<CatalogService>,
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        registry: Arc<GatewayRegistry>,
    ) -> Self {
        let order = Arc::new(OrderService::new(db.clone()));
        let lifecycle = Arc::new(OrderLifecycleService::new(
            db.clone(),
            event_sender.clone(),
        ));
        let catalog = Arc::new(CatalogService::new(db.clone()));
        let cart = Arc::new(CartService::new(
            db.clone(),
            config.default_currency.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            event_sender.clone(),
            order.clone(),
            CheckoutSettings {
                order_number_prefix: config.order_number_prefix.clone(),
                default_currency: config.default_currency.clone(),
                tax_rate: config.default_tax_rate,
                flat_shipping_rate: config.flat_shipping_rate,
            },
        ));
        let reconciler = Arc::new(WebhookReconciler::new(
            db.clone(),
            registry.clone(),
            event_sender,
        ));
        let payments = Arc::new(PaymentService::new(db, registry, reconciler.clone()));

        Self {
            order,
            lifecycle,
            catalog,
            cart,
            checkout,
            payments,
            reconciler,
        }
    }
}

pub(crate) fn parse_provider(raw: &str) -> Result<PaymentProvider, ServiceError> {
    raw.parse::<PaymentProvider>()
        .map_err(|_| ServiceError::NotFound(format!("Unknown payment provider '{}'", raw)))
}
