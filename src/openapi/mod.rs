use axum::{routing::get, Json, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::{
    entities::{
        OrderStatus, PaymentMethodKind, PaymentProvider, PaymentStatus, RefundReason,
        RefundStatus, WebhookOutcome,
    },
    errors::ErrorResponse,
    handlers::{self, AppState},
    services::{
        commerce::{
            AddToCartInput, AddressInput, CartLine, CartSnapshot, CreateOrderRequest,
            CreateProductInput, ProductView,
        },
        orders::{
            AddressResponse, OrderItemResponse, OrderResponse, OrderSummary, StatusHistoryEntry,
            TrackingInfo,
        },
        payments::{
            ConfirmPaymentInput, CreateIntentInput, CreateRefundInput, PaymentIntentResponse,
            PaymentView, ProviderCapabilities, RefundView, SavedPaymentMethod,
        },
    },
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Orderline API",
        version = "1.0.0",
        description = r#"
# Orderline API

Order lifecycle and payment reconciliation for storefronts.

## Authentication

Customer and admin endpoints take a bearer JWT whose `sub` claim is the
customer id:

```
Authorization: Bearer <your-jwt-token>
```

Admin endpoints additionally require the configured admin role.
Provider webhooks authenticate with the provider's own signature headers.

## Errors

Failures share one body shape:

```json
{
  "error": "Conflict",
  "message": "Invalid transition: pending -> shipped",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
"#
    ),
    paths(
        handlers::health::readiness_check,
        handlers::orders::create_order,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::orders::cancel_order,
        handlers::orders::reorder,
        handlers::orders::get_tracking,
        handlers::orders::list_order_payments,
        handlers::cart::get_cart,
        handlers::cart::add_item,
        handlers::cart::clear_cart,
        handlers::payments::create_intent,
        handlers::payments::confirm_payment,
        handlers::payments::get_payment,
        handlers::payments::list_providers,
        handlers::payments::list_methods,
        handlers::payments::attach_method,
        handlers::payments::detach_method,
        handlers::payment_webhooks::receive_webhook,
        handlers::admin::update_order_status,
        handlers::admin::update_tracking,
        handlers::admin::list_all_orders,
        handlers::admin::order_history,
        handlers::admin::create_refund,
        handlers::admin::list_refunds,
        handlers::admin::list_webhook_conflicts,
        handlers::admin::create_product,
    ),
    components(schemas(
        ErrorResponse,
        OrderStatus,
        PaymentProvider,
        PaymentMethodKind,
        PaymentStatus,
        RefundStatus,
        RefundReason,
        WebhookOutcome,
        AddressInput,
        CreateOrderRequest,
        AddressResponse,
        OrderItemResponse,
        OrderSummary,
        OrderResponse,
        StatusHistoryEntry,
        TrackingInfo,
        AddToCartInput,
        CartLine,
        CartSnapshot,
        CreateProductInput,
        ProductView,
        CreateIntentInput,
        ConfirmPaymentInput,
        CreateRefundInput,
        PaymentView,
        PaymentIntentResponse,
        RefundView,
        ProviderCapabilities,
        SavedPaymentMethod,
        handlers::orders::CancelOrderRequest,
        handlers::payments::AttachMethodRequest,
        handlers::payment_webhooks::WebhookAck,
        handlers::admin::UpdateOrderStatusRequest,
        handlers::admin::UpdateTrackingRequest,
        handlers::admin::WebhookConflictView,
        handlers::health::HealthResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "orders", description = "Customer order placement and tracking"),
        (name = "cart", description = "Shopping cart"),
        (name = "payments", description = "Payment intents, confirmation and saved methods"),
        (name = "webhooks", description = "Payment provider callbacks"),
        (name = "admin", description = "Administrative order, refund and review operations"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Serves the generated document as JSON
pub fn openapi_routes() -> Router<AppState> {
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}
