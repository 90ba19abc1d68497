#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use orderline_api::{
    config::{AppConfig, PayPalConfig, StripeConfig},
    db,
    entities::commerce::ProductModel,
    events::{self, EventSender},
    notifications::LogNotificationSender,
    services::{
        commerce::{AddToCartInput, AddressInput, CreateOrderRequest, CreateProductInput},
        orders::OrderResponse,
        payments::GatewayRegistry,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str =
    "integration_test_secret_key_that_is_comfortably_longer_than_sixty_four_characters";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const PAYPAL_WEBHOOK_SECRET: &str = "paypal_test_webhook_secret";

/// Which provider sections the test application is configured with.
#[derive(Default)]
pub struct Providers {
    pub stripe_base: Option<String>,
    pub paypal_base: Option<String>,
    pub default: Option<&'static str>,
}

/// Application state backed by a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_providers(Providers::default()).await
    }

    pub async fn with_providers(providers: Providers) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        // One connection: every pooled connection would otherwise get its
        // own empty in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_provider_timeout_secs = 2;
        cfg.default_payment_provider = providers.default.map(String::from);
        cfg.stripe = providers.stripe_base.map(|api_base| StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: STRIPE_WEBHOOK_SECRET.to_string(),
            api_base,
            webhook_tolerance_secs: 300,
        });
        cfg.paypal = providers.paypal_base.map(|api_base| PayPalConfig {
            client_id: "paypal-client".to_string(),
            client_secret: "paypal-secret".to_string(),
            webhook_secret: PAYPAL_WEBHOOK_SECRET.to_string(),
            api_base,
            return_url: Some("https://shop.example.com/return".to_string()),
            cancel_url: Some("https://shop.example.com/cancel".to_string()),
            webhook_tolerance_secs: 300,
        });

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let registry =
            Arc::new(GatewayRegistry::from_config(&cfg).expect("gateway registry for tests"));
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(
            event_rx,
            Arc::new(LogNotificationSender),
        ));

        let state = AppState::new(Arc::new(pool), cfg, EventSender::new(event_tx), registry);
        let router = orderline_api::app(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    pub fn customer_token(&self, customer_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(customer_id, &["customer"], chrono::Duration::hours(1))
            .expect("sign customer token")
    }

    pub fn admin_token(&self, admin_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(admin_id, &["admin"], chrono::Duration::hours(1))
            .expect("sign admin token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        self.request_with_headers(method, uri, body, token, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook body exactly as the provider would send it.
    pub async fn post_webhook(
        &self,
        provider: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/v1/webhooks/{}", provider))
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(body.to_vec())).expect("build request"))
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> ProductModel {
        self.state
            .services
            .catalog
            .create_product(CreateProductInput {
                sku: sku.to_string(),
                name: format!("Test Product {}", sku),
                price,
                stock_quantity: stock,
                image_url: None,
            })
            .await
            .expect("seed product")
    }

    pub async fn add_to_cart(&self, customer_id: Uuid, product_id: Uuid, quantity: i32) {
        self.state
            .services
            .cart
            .add_item(
                customer_id,
                AddToCartInput {
                    product_id,
                    variant_id: None,
                    quantity,
                },
            )
            .await
            .expect("add item to cart");
    }

    /// Seeds a product, fills the cart and checks out. Returns the new order.
    pub async fn place_order(&self, customer_id: Uuid, sku: &str, price: Decimal, quantity: i32) -> OrderResponse {
        let product = self.seed_product(sku, price, 100).await;
        self.add_to_cart(customer_id, product.id, quantity).await;
        self.state
            .services
            .checkout
            .create_order(customer_id, order_request())
            .await
            .expect("checkout")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn address() -> AddressInput {
    AddressInput {
        name: "Ada Lovelace".to_string(),
        line1: "12 Analytical Way".to_string(),
        line2: None,
        city: "London".to_string(),
        region: None,
        postal_code: "N1 9GU".to_string(),
        country: "GB".to_string(),
        phone: None,
    }
}

pub fn order_request() -> CreateOrderRequest {
    CreateOrderRequest {
        shipping_address: address(),
        billing_address: None,
        notes: None,
        currency: None,
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
