//! Order status lifecycle: transition table enforcement, customer
//! cancellation rules and the append-only history log.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use orderline_api::{
    entities::{order, OrderStatus},
    errors::ServiceError,
    services::order_lifecycle::apply_transition,
};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

async fn advance(app: &TestApp, order_id: Uuid, path: &[OrderStatus]) {
    for status in path {
        app.state
            .services
            .lifecycle
            .transition(order_id, *status, None, None)
            .await
            .expect("legal transition");
    }
}

#[tokio::test]
async fn pending_order_cannot_jump_to_shipped() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-JUMP", dec!(25.00), 1).await;

    let err = app
        .state
        .services
        .lifecycle
        .transition(order.order.id, OrderStatus::Shipped, None, None)
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InvalidTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Shipped
        }
    );

    let history = app.state.services.lifecycle.history(order.order.id).await.unwrap();
    assert_eq!(history.len(), 1, "rejected transition must not write history");
}

#[tokio::test]
async fn shipping_a_processing_order_stamps_shipped_at_and_history() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-SHIP", dec!(25.00), 1).await;
    let order_id = order.order.id;
    advance(&app, order_id, &[OrderStatus::Confirmed, OrderStatus::Processing]).await;

    let shipped = app
        .state
        .services
        .lifecycle
        .transition(order_id, OrderStatus::Shipped, Some("Left warehouse".into()), None)
        .await
        .expect("processing -> shipped");

    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert!(shipped.shipped_at.is_some());

    let history = app.state.services.lifecycle.history(order_id).await.unwrap();
    let last = history.last().expect("history entry");
    assert_eq!(last.from_status, Some(OrderStatus::Processing));
    assert_eq!(last.to_status, OrderStatus::Shipped);
    assert_eq!(last.note.as_deref(), Some("Left warehouse"));
    assert_eq!(
        history
            .iter()
            .filter(|h| h.to_status == OrderStatus::Shipped)
            .count(),
        1
    );
}

#[tokio::test]
async fn history_replays_to_current_status() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-HIST", dec!(25.00), 1).await;
    let order_id = order.order.id;
    advance(
        &app,
        order_id,
        &[
            OrderStatus::Confirmed,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ],
    )
    .await;

    let history = app.state.services.lifecycle.history(order_id).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].from_status, None);
    assert_eq!(history[0].to_status, OrderStatus::Pending);
    for pair in history.windows(2) {
        assert_eq!(pair[1].from_status, Some(pair[0].to_status));
        assert!(pair[1].sequence > pair[0].sequence);
    }

    let current = app
        .state
        .services
        .order
        .get_order(order_id, None)
        .await
        .unwrap();
    assert_eq!(current.order.status, OrderStatus::Delivered);
    assert!(current.order.delivered_at.is_some());
}

#[tokio::test]
async fn cancellation_window_closes_at_shipment() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-WINDOW", dec!(25.00), 1).await;
    let order_id = order.order.id;
    let lifecycle = &app.state.services.lifecycle;

    advance(&app, order_id, &[OrderStatus::Confirmed, OrderStatus::Processing]).await;
    assert!(lifecycle.can_cancel(order_id, customer).await.unwrap());
    assert!(!lifecycle.can_cancel(order_id, Uuid::new_v4()).await.unwrap());

    advance(&app, order_id, &[OrderStatus::Shipped]).await;
    assert!(!lifecycle.can_cancel(order_id, customer).await.unwrap());

    let err = lifecycle
        .cancel_by_customer(order_id, customer, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}

#[tokio::test]
async fn customer_cannot_cancel_someone_elses_order() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let order = app.place_order(owner, "LC-OWNER", dec!(25.00), 1).await;

    let err = app
        .state
        .services
        .lifecycle
        .cancel_by_customer(order.order.id, Uuid::new_v4(), Some("mine now".into()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));

    let cancelled = app
        .state
        .services
        .lifecycle
        .cancel_by_customer(order.order.id, owner, Some("changed my mind".into()))
        .await
        .expect("owner cancels");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let history = app.state.services.lifecycle.history(order.order.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.note.as_deref(), Some("changed my mind"));
    assert_eq!(last.actor_id, Some(owner));
}

#[tokio::test]
async fn terminal_orders_reject_every_transition() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-TERM", dec!(25.00), 1).await;
    advance(&app, order.order.id, &[OrderStatus::Cancelled]).await;

    for target in OrderStatus::ALL {
        let result = app
            .state
            .services
            .lifecycle
            .transition(order.order.id, target, None, None)
            .await;
        assert_matches!(result, Err(ServiceError::InvalidTransition { .. }));
    }
}

#[tokio::test]
async fn tracking_reports_status_history_and_estimate() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let order = app.place_order(customer, "LC-TRACK", dec!(25.00), 1).await;
    let order_id = order.order.id;
    advance(
        &app,
        order_id,
        &[OrderStatus::Confirmed, OrderStatus::Processing, OrderStatus::Shipped],
    )
    .await;
    app.state
        .services
        .lifecycle
        .set_tracking(order_id, "UPS".into(), "1Z999".into())
        .await
        .unwrap();

    let tracking = app
        .state
        .services
        .order
        .tracking(order_id, Some(customer))
        .await
        .unwrap();
    assert_eq!(tracking.status, OrderStatus::Shipped);
    assert_eq!(tracking.carrier.as_deref(), Some("UPS"));
    assert_eq!(tracking.tracking_number.as_deref(), Some("1Z999"));
    assert_eq!(tracking.history.len(), 4);
    let shipped_at = tracking.shipped_at.expect("shipped_at");
    assert_eq!(tracking.estimated_delivery, shipped_at + chrono::Duration::days(5));

    let err = app
        .state
        .services
        .order
        .tracking(order_id, Some(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));
}

#[tokio::test]
async fn stale_snapshot_loses_to_the_first_writer() {
    let app = TestApp::new().await;
    let order = app
        .place_order(Uuid::new_v4(), "LC-STALE", dec!(25.00), 1)
        .await;
    let order_id = order.order.id;

    let snapshot = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("order row");
    advance(&app, order_id, &[OrderStatus::Confirmed]).await;

    let err = apply_transition(&*app.state.db, &snapshot, OrderStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ConcurrentModification(id) if id == order_id);

    let history = app.state.services.lifecycle.history(order_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().map(|h| h.to_status), Some(OrderStatus::Confirmed));
}

#[tokio::test]
async fn racing_transitions_apply_exactly_once() {
    let app = TestApp::new().await;
    let order = app
        .place_order(Uuid::new_v4(), "LC-RACE", dec!(25.00), 1)
        .await;
    let order_id = order.order.id;
    let lifecycle = &app.state.services.lifecycle;

    // e.g. an admin confirmation racing the payment webhook
    let (first, second) = tokio::join!(
        lifecycle.transition(order_id, OrderStatus::Confirmed, None, None),
        lifecycle.transition(order_id, OrderStatus::Confirmed, None, None),
    );

    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );
    let history = lifecycle.history(order_id).await.unwrap();
    assert_eq!(history.len(), 2);

    let current = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("order row");
    assert_eq!(history.last().map(|h| h.to_status), Some(current.status));
}
