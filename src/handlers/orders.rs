use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::AppState;
use crate::{
    auth::AuthUser,
    entities::order::OrderStatus,
    errors::{ErrorResponse, ServiceError},
    services::{
        commerce::{CartSnapshot, CreateOrderRequest},
        orders::{OrderFilter, OrderResponse, OrderSummary, TrackingInfo},
        payments::PaymentView,
    },
    ApiResponse, PaginatedResponse,
};

/// Query parameters for order listings
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    pub status: Option<OrderStatus>,
    /// Inclusive lower bound on creation time (RFC 3339)
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on creation time (RFC 3339)
    pub to: Option<DateTime<Utc>>,
    /// Matches order number or notes
    pub search: Option<String>,
    /// Admin listings only; customer listings are always scoped to the caller
    pub customer_id: Option<Uuid>,
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    20
}

impl OrderListQuery {
    pub(crate) fn into_filter(self, scope: Option<Uuid>) -> (OrderFilter, u64, u64) {
        (
            OrderFilter {
                customer_id: scope.or(self.customer_id),
                status: self.status,
                from: self.from,
                to: self.to,
                search: self.search,
            },
            self.page,
            self.limit,
        )
    }
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Creates the order routes
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/reorder", post(reorder))
        .route("/:id/tracking", get(get_tracking))
        .route("/:id/payments", get(list_order_payments))
}

/// Place an order from the caller's cart
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid request or empty cart", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 422, description = "Insufficient stock", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .checkout
        .create_order(user.user_id, payload)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// List the caller's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Orders listed", body = ApiResponse<PaginatedResponse<OrderSummary>>),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderSummary>>>, ServiceError> {
    let (filter, page, limit) = query.into_filter(Some(user.user_id));
    let orders = state.services.order.list_orders(filter, page, limit).await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// Get one of the caller's orders with items and addresses
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order found", body = ApiResponse<OrderResponse>),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .order
        .get_order(id, Some(user.user_id))
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Cancel an order that has not shipped yet
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderSummary>),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse),
        (status = 409, description = "Order can no longer be cancelled", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelOrderRequest>>,
) -> Result<Json<ApiResponse<OrderSummary>>, ServiceError> {
    let Json(payload) = payload.unwrap_or_default();
    payload.validate()?;

    let order = state
        .services
        .lifecycle
        .cancel_by_customer(id, user.user_id, payload.reason)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// Copy a past order's items into the cart at current prices
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/reorder",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Items added to cart", body = ApiResponse<CartSnapshot>),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn reorder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<CartSnapshot>>, ServiceError> {
    let cart = state.services.checkout.reorder(id, user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Current status, history and estimated delivery
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/tracking",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Tracking details", body = ApiResponse<TrackingInfo>),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_tracking(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<TrackingInfo>>, ServiceError> {
    let tracking = state
        .services
        .order
        .tracking(id, Some(user.user_id))
        .await?;
    Ok(Json(ApiResponse::success(tracking)))
}

/// Payments recorded against one of the caller's orders
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payments",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payments for the order", body = ApiResponse<Vec<PaymentView>>),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn list_order_payments(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<PaymentView>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .list_order_payments(id, Some(user.user_id))
        .await?;
    Ok(Json(ApiResponse::success(payments)))
}
