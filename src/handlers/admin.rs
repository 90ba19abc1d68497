use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::{orders::OrderListQuery, AppState};
use crate::{
    auth::AdminUser,
    entities::{order::OrderStatus, webhook_event, PaymentProvider, WebhookOutcome},
    errors::{ErrorResponse, ServiceError},
    services::{
        commerce::{CreateProductInput, ProductView},
        orders::{OrderSummary, StatusHistoryEntry},
        payments::{CreateRefundInput, RefundView},
    },
    ApiResponse, ListQuery, PaginatedResponse,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateTrackingRequest {
    #[validate(length(min = 1, max = 100))]
    pub carrier: String,
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: String,
}

/// A webhook delivery awaiting manual review
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookConflictView {
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub event_id: Option<String>,
    pub event_type: String,
    pub external_id: Option<String>,
    pub outcome: WebhookOutcome,
    pub detail: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl From<webhook_event::Model> for WebhookConflictView {
    fn from(m: webhook_event::Model) -> Self {
        Self {
            id: m.id,
            provider: m.provider,
            event_id: m.event_id,
            event_type: m.event_type,
            external_id: m.external_id,
            outcome: m.outcome,
            detail: m.detail,
            received_at: m.received_at,
        }
    }
}

/// Creates the admin routes. Every handler requires the admin role.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_all_orders))
        .route("/orders/:id/status", put(update_order_status))
        .route("/orders/:id/tracking", put(update_tracking))
        .route("/orders/:id/history", get(order_history))
        .route(
            "/payments/:payment_id/refunds",
            post(create_refund).get(list_refunds),
        )
        .route("/webhooks/conflicts", get(list_webhook_conflicts))
        .route("/products", post(create_product))
}

/// Move an order to a new status, subject to the transition table
#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderSummary>),
        (status = 403, description = "Admin role required", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse),
        (status = 409, description = "Transition not allowed or concurrent update", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderSummary>>, ServiceError> {
    payload.validate()?;
    let order = state
        .services
        .lifecycle
        .admin_transition(id, payload.status, payload.notes, admin.user_id)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/tracking",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateTrackingRequest,
    responses(
        (status = 200, description = "Tracking recorded", body = ApiResponse<OrderSummary>),
        (status = 404, description = "Order not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn update_tracking(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateTrackingRequest>,
) -> Result<Json<ApiResponse<OrderSummary>>, ServiceError> {
    payload.validate()?;
    let order = state
        .services
        .lifecycle
        .set_tracking(id, payload.carrier, payload.tracking_number)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// All orders, optionally narrowed to one customer
#[utoipa::path(
    get,
    path = "/api/v1/admin/orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Orders listed", body = ApiResponse<PaginatedResponse<OrderSummary>>),
        (status = 403, description = "Admin role required", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn list_all_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderSummary>>>, ServiceError> {
    let (filter, page, limit) = query.into_filter(None);
    let orders = state.services.order.list_orders(filter, page, limit).await?;
    Ok(Json(ApiResponse::success(orders)))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders/{id}/history",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Status history, oldest first", body = ApiResponse<Vec<StatusHistoryEntry>>),
        (status = 404, description = "Order not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn order_history(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<StatusHistoryEntry>>>, ServiceError> {
    let history = state.services.lifecycle.history(id).await?;
    Ok(Json(ApiResponse::success(
        history.into_iter().map(StatusHistoryEntry::from).collect(),
    )))
}

/// Refund part or all of a succeeded payment
#[utoipa::path(
    post,
    path = "/api/v1/admin/payments/{payment_id}/refunds",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    request_body = CreateRefundInput,
    responses(
        (status = 201, description = "Refund recorded", body = ApiResponse<RefundView>),
        (status = 400, description = "Payment not refundable", body = ErrorResponse),
        (status = 402, description = "Provider rejected the refund", body = ErrorResponse),
        (status = 409, description = "Concurrent refund", body = ErrorResponse),
        (status = 422, description = "Amount exceeds the refundable balance", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn create_refund(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<CreateRefundInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let refund = state
        .services
        .payments
        .create_refund(payment_id, payload, admin.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(refund))))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/payments/{payment_id}/refunds",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Refunds for the payment", body = ApiResponse<Vec<RefundView>>),
        (status = 404, description = "Payment not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn list_refunds(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<RefundView>>>, ServiceError> {
    let refunds = state.services.payments.list_refunds(payment_id).await?;
    Ok(Json(ApiResponse::success(refunds)))
}

/// Webhook deliveries that contradicted a settled record
#[utoipa::path(
    get,
    path = "/api/v1/admin/webhooks/conflicts",
    params(
        ("page" = Option<u64>, Query, description = "Page number"),
        ("limit" = Option<u64>, Query, description = "Items per page")
    ),
    responses(
        (status = 200, description = "Conflict queue", body = ApiResponse<PaginatedResponse<WebhookConflictView>>)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn list_webhook_conflicts(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<WebhookConflictView>>>, ServiceError> {
    let page = state
        .services
        .reconciler
        .conflicts(query.page, query.limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items: page.items.into_iter().map(WebhookConflictView::from).collect(),
        total: page.total,
        page: page.page,
        limit: page.limit,
        total_pages: page.total_pages,
    })))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/products",
    request_body = CreateProductInput,
    responses(
        (status = 201, description = "Product created", body = ApiResponse<ProductView>),
        (status = 400, description = "Invalid product", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CreateProductInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.catalog.create_product(payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(ProductView::from(product))),
    ))
}
