//! Payment intents, confirmation and refunds against mocked providers.

mod common;

use assert_matches::assert_matches;
use common::{Providers, TestApp};
use orderline_api::{
    entities::{OrderStatus, PaymentProvider, PaymentStatus, RefundReason, RefundStatus},
    errors::ServiceError,
    services::payments::{ConfirmPaymentInput, CreateIntentInput, CreateRefundInput},
};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    matchers::{body_string_contains, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn stripe_app(server: &MockServer) -> TestApp {
    TestApp::with_providers(Providers {
        stripe_base: Some(server.uri()),
        ..Default::default()
    })
    .await
}

async fn mock_stripe_intent(server: &MockServer, id: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(body_string_contains("amount=5000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "status": "requires_payment_method",
            "client_secret": format!("{}_secret_abc", id),
        })))
        .mount(server)
        .await;
}

async fn mock_stripe_confirm(server: &MockServer, id: &str, status: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/payment_intents/{}/confirm", id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "status": status,
        })))
        .mount(server)
        .await;
}

/// Places a 50.00 order and pays it through the mocked Stripe API.
async fn paid_stripe_order(app: &TestApp, server: &MockServer, customer: Uuid) -> (Uuid, Uuid) {
    let order = app.place_order(customer, "PAY-PAID", dec!(25.00), 2).await;
    mock_stripe_intent(server, "pi_paid").await;
    mock_stripe_confirm(server, "pi_paid", "succeeded").await;

    let intent = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: None,
                metadata: None,
            },
        )
        .await
        .expect("intent");
    app.state
        .services
        .payments
        .confirm_payment(intent.payment.id, Some(customer), ConfirmPaymentInput::default())
        .await
        .expect("confirm");
    (order.order.id, intent.payment.id)
}

#[tokio::test]
async fn stripe_intent_then_confirmation_confirms_the_order() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PAY-STRIPE", dec!(25.00), 2).await;
    mock_stripe_intent(&server, "pi_123").await;
    mock_stripe_confirm(&server, "pi_123", "succeeded").await;

    let intent = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: Some(PaymentProvider::Stripe),
                metadata: None,
            },
        )
        .await
        .expect("intent created");

    assert_eq!(intent.payment.external_id, "pi_123");
    assert_eq!(intent.payment.status, PaymentStatus::Pending);
    assert_eq!(intent.payment.amount, dec!(50.00));
    assert_eq!(intent.client_token.as_deref(), Some("pi_123_secret_abc"));

    let confirmed = app
        .state
        .services
        .payments
        .confirm_payment(
            intent.payment.id,
            Some(customer),
            ConfirmPaymentInput {
                payment_method: Some("pm_card_visa".into()),
                return_url: None,
            },
        )
        .await
        .expect("confirmed");
    assert_eq!(confirmed.status, PaymentStatus::Succeeded);
    assert!(confirmed.processed_at.is_some());

    let order = app
        .state
        .services
        .order
        .get_order(order.order.id, Some(customer))
        .await
        .unwrap();
    assert_eq!(order.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn requires_action_is_surfaced_without_touching_the_order() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PAY-3DS", dec!(25.00), 2).await;
    mock_stripe_intent(&server, "pi_3ds").await;
    mock_stripe_confirm(&server, "pi_3ds", "requires_action").await;

    let intent = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: None,
                metadata: None,
            },
        )
        .await
        .unwrap();
    let payment = app
        .state
        .services
        .payments
        .confirm_payment(intent.payment.id, Some(customer), ConfirmPaymentInput::default())
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::RequiresAction);
    assert!(payment.requires_action);
    let order = app.state.services.order.get_order(order.order.id, None).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn provider_error_leaves_no_payment_behind() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PAY-DOWN", dec!(25.00), 2).await;
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {"message": "Your card was declined.", "code": "card_declined"}
        })))
        .mount(&server)
        .await;

    let err = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: None,
                metadata: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ProviderError(msg) if msg.contains("declined"));

    let payments = app
        .state
        .services
        .payments
        .list_order_payments(order.order.id, Some(customer))
        .await
        .unwrap();
    assert!(payments.is_empty());
}

#[tokio::test]
async fn intent_for_someone_elses_order_is_unauthorized() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let order = app.place_order(Uuid::new_v4(), "PAY-OTHER", dec!(25.00), 1).await;

    let err = app
        .state
        .services
        .payments
        .create_payment_intent(
            Uuid::new_v4(),
            CreateIntentInput {
                order_id: order.order.id,
                provider: None,
                metadata: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));
}

#[tokio::test]
async fn unconfigured_provider_is_not_supported() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PAY-NONE", dec!(25.00), 1).await;

    let err = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: Some(PaymentProvider::PayPal),
                metadata: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotSupported(_));
}

#[tokio::test]
async fn refund_within_balance_is_recorded() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let (_order_id, payment_id) = paid_stripe_order(&app, &server, customer).await;

    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .and(header_exists("idempotency-key"))
        .and(body_string_contains("amount=2500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_1",
            "status": "succeeded",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let refund = app
        .state
        .services
        .payments
        .create_refund(
            payment_id,
            CreateRefundInput {
                amount: dec!(25.00),
                reason: RefundReason::RequestedByCustomer,
                note: Some("one item damaged".into()),
            },
            admin,
        )
        .await
        .expect("refund");

    assert_eq!(refund.status, RefundStatus::Succeeded);
    assert_eq!(refund.external_id.as_deref(), Some("re_1"));
    assert_eq!(refund.amount, dec!(25.00));
    assert_eq!(refund.processed_by, Some(admin));
}

#[tokio::test]
async fn over_refund_is_rejected_before_calling_the_provider() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let (_order_id, payment_id) = paid_stripe_order(&app, &server, customer).await;

    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_first",
            "status": "succeeded",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payments = &app.state.services.payments;
    payments
        .create_refund(
            payment_id,
            CreateRefundInput {
                amount: dec!(25.00),
                reason: RefundReason::RequestedByCustomer,
                note: None,
            },
            Uuid::new_v4(),
        )
        .await
        .expect("first refund");

    let err = payments
        .create_refund(
            payment_id,
            CreateRefundInput {
                amount: dec!(50.00),
                reason: RefundReason::RequestedByCustomer,
                note: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientRefundableAmount { requested, remaining }
            if requested == dec!(50.00) && remaining == dec!(25.00)
    );

    let refunds = payments.list_refunds(payment_id).await.unwrap();
    assert_eq!(refunds.len(), 1);
}

#[tokio::test]
async fn rejected_refund_is_marked_failed_and_frees_the_balance() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let (_order_id, payment_id) = paid_stripe_order(&app, &server, customer).await;

    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Charge already refunded"}
        })))
        .mount(&server)
        .await;

    let payments = &app.state.services.payments;
    let err = payments
        .create_refund(
            payment_id,
            CreateRefundInput {
                amount: dec!(50.00),
                reason: RefundReason::Duplicate,
                note: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ProviderError(_));

    let refunds = payments.list_refunds(payment_id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, RefundStatus::Failed);
    assert!(refunds[0].failure_reason.is_some());
}

#[tokio::test]
async fn refund_of_unsettled_payment_is_rejected() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PAY-UNSETTLED", dec!(25.00), 2).await;
    mock_stripe_intent(&server, "pi_open").await;

    let intent = app
        .state
        .services
        .payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

    let err = app
        .state
        .services
        .payments
        .create_refund(
            intent.payment.id,
            CreateRefundInput {
                amount: dec!(1.00),
                reason: RefundReason::Other,
                note: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn paypal_token_is_fetched_once_and_reused() {
    let server = MockServer::start().await;
    let app = TestApp::with_providers(Providers {
        paypal_base: Some(server.uri()),
        ..Default::default()
    })
    .await;
    let customer = Uuid::new_v4();
    let first = app.place_order(customer, "PP-ONE", dec!(25.00), 1).await;
    let second = app.place_order(customer, "PP-TWO", dec!(25.00), 1).await;

    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21AA-token",
            "expires_in": 32400,
        })))
        .expect(1)
        .mount(&server)
        .await;
    for paypal_order in ["5O190127TN364715T", "8MC585209K746392H"] {
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .and(header("authorization", "Bearer A21AA-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": paypal_order,
                "status": "CREATED",
                "links": [{
                    "href": format!("https://www.sandbox.paypal.com/checkoutnow?token={}", paypal_order),
                    "rel": "approve"
                }],
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
    }

    let mut external_ids = Vec::new();
    for order in [&first, &second] {
        let intent = app
            .state
            .services
            .payments
            .create_payment_intent(
                customer,
                CreateIntentInput {
                    order_id: order.order.id,
                    provider: Some(PaymentProvider::PayPal),
                    metadata: None,
                },
            )
            .await
            .expect("paypal order created");
        assert_eq!(intent.payment.status, PaymentStatus::Pending);
        assert!(intent
            .client_token
            .as_deref()
            .is_some_and(|url| url.contains("checkoutnow")));
        assert_eq!(intent.next_action.as_deref(), Some("redirect_to_approval"));
        external_ids.push(intent.payment.external_id);
    }
    assert_ne!(external_ids[0], external_ids[1]);
}

#[tokio::test]
async fn paypal_capture_records_capture_id_for_refunds() {
    let server = MockServer::start().await;
    let app = TestApp::with_providers(Providers {
        paypal_base: Some(server.uri()),
        ..Default::default()
    })
    .await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "PP-CAPTURE", dec!(25.00), 2).await;

    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21AA-token",
            "expires_in": 32400,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PPORDER1",
            "status": "CREATED",
            "links": [{"href": "https://paypal.example/approve", "rel": "approve"}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/PPORDER1/capture"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PPORDER1",
            "status": "COMPLETED",
            "purchase_units": [{
                "payments": {"captures": [{"id": "CAPTURE1", "status": "COMPLETED"}]}
            }],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/payments/captures/CAPTURE1/refund"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "PPREFUND1",
            "status": "COMPLETED",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payments = &app.state.services.payments;
    let intent = payments
        .create_payment_intent(
            customer,
            CreateIntentInput {
                order_id: order.order.id,
                provider: Some(PaymentProvider::PayPal),
                metadata: None,
            },
        )
        .await
        .unwrap();
    let captured = payments
        .confirm_payment(intent.payment.id, Some(customer), ConfirmPaymentInput::default())
        .await
        .unwrap();
    assert_eq!(captured.status, PaymentStatus::Succeeded);

    let refund = payments
        .create_refund(
            intent.payment.id,
            CreateRefundInput {
                amount: dec!(12.25),
                reason: RefundReason::RequestedByCustomer,
                note: None,
            },
            Uuid::new_v4(),
        )
        .await
        .expect("paypal refund");
    assert_eq!(refund.external_id.as_deref(), Some("PPREFUND1"));
    assert_eq!(refund.status, RefundStatus::Succeeded);
}

#[tokio::test]
async fn paypal_does_not_offer_saved_methods() {
    let server = MockServer::start().await;
    let app = TestApp::with_providers(Providers {
        paypal_base: Some(server.uri()),
        ..Default::default()
    })
    .await;

    let err = app
        .state
        .services
        .payments
        .list_payment_methods(PaymentProvider::PayPal, "cus_1")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotSupported(_));
}

#[tokio::test]
async fn stripe_saved_methods_are_listed() {
    let server = MockServer::start().await;
    let app = stripe_app(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/payment_methods"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "pm_1",
                "type": "card",
                "card": {"brand": "visa", "last4": "4242", "exp_month": 12, "exp_year": 2030}
            }]
        })))
        .mount(&server)
        .await;

    let methods = app
        .state
        .services
        .payments
        .list_payment_methods(PaymentProvider::Stripe, "cus_1")
        .await
        .unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].id, "pm_1");
    assert_eq!(methods[0].last4.as_deref(), Some("4242"));
}
