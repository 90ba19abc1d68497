use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use super::AppState;
use crate::{
    auth::AuthUser,
    errors::{ErrorResponse, ServiceError},
    services::commerce::{AddToCartInput, CartSnapshot},
    ApiResponse,
};

pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart).delete(clear_cart))
        .route("/items", post(add_item))
}

/// The caller's cart; empty when none exists yet
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    responses(
        (status = 200, description = "Current cart", body = ApiResponse<CartSnapshot>),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<CartSnapshot>>, ServiceError> {
    let cart = state.services.cart.get_cart(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Add a product at its current price
#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    request_body = AddToCartInput,
    responses(
        (status = 200, description = "Item added", body = ApiResponse<CartSnapshot>),
        (status = 400, description = "Invalid quantity", body = ErrorResponse),
        (status = 404, description = "Product not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddToCartInput>,
) -> Result<Json<ApiResponse<CartSnapshot>>, ServiceError> {
    let cart = state.services.cart.add_item(user.user_id, payload).await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart",
    responses((status = 204, description = "Cart cleared")),
    security(("Bearer" = [])),
    tag = "cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, ServiceError> {
    state.services.cart.clear_cart(user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
