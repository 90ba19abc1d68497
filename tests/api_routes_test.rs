//! HTTP surface: routing, authentication and error mapping.

mod common;

use axum::http::{Method, StatusCode};
use common::{address, response_json, TestApp};
use rstest::rstest;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], json!("up"));
    assert_eq!(body["database"]["status"], json!("up"));

    let response = app.request(Method::GET, "/health/live", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new().await;
    let response = app
        .request_with_headers(
            Method::GET,
            "/api/v1/status",
            None,
            None,
            &[("x-request-id", "req-from-client")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-from-client")
    );
}

#[rstest]
#[case::orders_without_token(Method::GET, "/api/v1/orders", None)]
#[case::cart_with_garbage_token(Method::GET, "/api/v1/cart", Some("not-a-jwt"))]
#[case::checkout_without_token(Method::POST, "/api/v1/orders", None)]
#[case::admin_with_garbage_token(Method::GET, "/api/v1/admin/orders", Some("not-a-jwt"))]
#[tokio::test]
async fn protected_routes_require_a_valid_token(
    #[case] method: Method,
    #[case] uri: &str,
    #[case] token: Option<&str>,
) {
    let app = TestApp::new().await;
    let response = app.request(method, uri, None, token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_reject_customers() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());

    let response = app
        .request(Method::GET, "/api/v1/admin/orders", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = app.admin_token(Uuid::new_v4());
    let response = app
        .request(Method::GET, "/api/v1/admin/orders", None, Some(&admin))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cart_to_order_over_http() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let token = app.customer_token(customer);
    let product = app.seed_product("HTTP-1", dec!(25.00), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({"product_id": product.id, "quantity": 2})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({"shipping_address": address()})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["status"], json!("pending"));
    assert_eq!(body["data"]["items"].as_array().map(Vec::len), Some(1));
    let order_id = body["data"]["id"].as_str().expect("order id").to_string();

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["total"], json!(1));

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            Some(json!({"reason": "ordered by mistake"})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], json!("cancelled"));
}

#[tokio::test]
async fn checkout_with_empty_cart_is_a_bad_request() {
    let app = TestApp::new().await;
    let token = app.customer_token(Uuid::new_v4());

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({"shipping_address": address()})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["message"].as_str().is_some());
    assert!(body["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn other_customers_order_is_forbidden() {
    let app = TestApp::new().await;
    let order = app
        .place_order(Uuid::new_v4(), "HTTP-OWN", dec!(25.00), 1)
        .await;
    let stranger = app.customer_token(Uuid::new_v4());

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order.order.id),
            None,
            Some(&stranger),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&stranger),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_drives_status_and_rejects_illegal_moves() {
    let app = TestApp::new().await;
    let order = app
        .place_order(Uuid::new_v4(), "HTTP-ADMIN", dec!(25.00), 1)
        .await;
    let admin = app.admin_token(Uuid::new_v4());
    let uri = format!("/api/v1/admin/orders/{}/status", order.order.id);

    let response = app
        .request(Method::PUT, &uri, Some(json!({"status": "shipped"})), Some(&admin))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({"status": "confirmed", "notes": "paid by bank transfer"})),
            Some(&admin),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["data"]["status"], json!("confirmed"));

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/admin/orders/{}/history", order.order.id),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn unknown_webhook_provider_is_not_found() {
    let app = TestApp::new().await;
    let response = app.post_webhook("venmo", b"{}", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/api-docs/openapi.json", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert!(body["paths"]["/api/v1/orders"].is_object());
    assert!(body["paths"]["/api/v1/webhooks/{provider}"].is_object());

    let checkout = &body["paths"]["/api/v1/orders"]["post"]["responses"];
    assert!(checkout["422"].is_object());
    assert!(checkout["409"].is_null());
}

#[tokio::test]
async fn insufficient_stock_is_unprocessable() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let token = app.customer_token(customer);
    let product = app.seed_product("HTTP-SCARCE", dec!(5.00), 1).await;
    app.add_to_cart(customer, product.id, 2).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({"shipping_address": address()})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
