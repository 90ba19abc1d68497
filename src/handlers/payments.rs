use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{parse_provider, AppState};
use crate::{
    auth::AuthUser,
    errors::{ErrorResponse, ServiceError},
    services::payments::{
        ConfirmPaymentInput, CreateIntentInput, PaymentIntentResponse, PaymentView,
        ProviderCapabilities, SavedPaymentMethod,
    },
    ApiResponse,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AttachMethodRequest {
    /// Provider-side payment method id
    pub method_id: String,
}

/// Creates the payment routes
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/intents", post(create_intent))
        .route("/providers", get(list_providers))
        .route(
            "/providers/:provider/customers/:customer_ref/methods",
            get(list_methods).post(attach_method),
        )
        .route(
            "/providers/:provider/methods/:method_id",
            delete(detach_method),
        )
        .route("/:payment_id", get(get_payment))
        .route("/:payment_id/confirm", post(confirm_payment))
}

/// Open a payment for a pending order
#[utoipa::path(
    post,
    path = "/api/v1/payments/intents",
    request_body = CreateIntentInput,
    responses(
        (status = 201, description = "Payment intent created", body = ApiResponse<PaymentIntentResponse>),
        (status = 400, description = "Order not payable or provider not configured", body = ErrorResponse),
        (status = 403, description = "Order belongs to another customer", body = ErrorResponse),
        (status = 402, description = "Provider declined or unavailable", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn create_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateIntentInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state
        .services
        .payments
        .create_payment_intent(user.user_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(intent))))
}

/// Confirm a card payment or capture an approved redirect payment
#[utoipa::path(
    post,
    path = "/api/v1/payments/{payment_id}/confirm",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    request_body = ConfirmPaymentInput,
    responses(
        (status = 200, description = "Payment after the provider responded", body = ApiResponse<PaymentView>),
        (status = 403, description = "Payment belongs to another customer", body = ErrorResponse),
        (status = 402, description = "Provider declined or unavailable", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(payment_id): Path<Uuid>,
    payload: Option<Json<ConfirmPaymentInput>>,
) -> Result<Json<ApiResponse<PaymentView>>, ServiceError> {
    let Json(payload) = payload.unwrap_or_default();
    let payment = state
        .services
        .payments
        .confirm_payment(payment_id, Some(user.user_id), payload)
        .await?;
    Ok(Json(ApiResponse::success(payment)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{payment_id}",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Payment found", body = ApiResponse<PaymentView>),
        (status = 404, description = "Payment not found", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentView>>, ServiceError> {
    let payment = state
        .services
        .payments
        .get_payment(payment_id, Some(user.user_id))
        .await?;
    Ok(Json(ApiResponse::success(payment)))
}

/// Configured providers and what they support
#[utoipa::path(
    get,
    path = "/api/v1/payments/providers",
    responses((status = 200, description = "Configured providers", body = ApiResponse<Vec<ProviderCapabilities>>)),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn list_providers(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Json<ApiResponse<Vec<ProviderCapabilities>>> {
    Json(ApiResponse::success(state.services.payments.providers()))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/providers/{provider}/customers/{customer_ref}/methods",
    params(
        ("provider" = String, Path, description = "Provider name"),
        ("customer_ref" = String, Path, description = "Provider-side customer reference")
    ),
    responses(
        (status = 200, description = "Saved methods", body = ApiResponse<Vec<SavedPaymentMethod>>),
        (status = 400, description = "Provider does not support saved methods", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn list_methods(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((provider, customer_ref)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Vec<SavedPaymentMethod>>>, ServiceError> {
    let methods = state
        .services
        .payments
        .list_payment_methods(parse_provider(&provider)?, &customer_ref)
        .await?;
    Ok(Json(ApiResponse::success(methods)))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/providers/{provider}/customers/{customer_ref}/methods",
    params(
        ("provider" = String, Path, description = "Provider name"),
        ("customer_ref" = String, Path, description = "Provider-side customer reference")
    ),
    request_body = AttachMethodRequest,
    responses(
        (status = 201, description = "Method attached", body = ApiResponse<SavedPaymentMethod>),
        (status = 400, description = "Provider does not support saved methods", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn attach_method(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((provider, customer_ref)): Path<(String, String)>,
    Json(payload): Json<AttachMethodRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let method = state
        .services
        .payments
        .attach_payment_method(parse_provider(&provider)?, &customer_ref, &payload.method_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(method))))
}

#[utoipa::path(
    delete,
    path = "/api/v1/payments/providers/{provider}/methods/{method_id}",
    params(
        ("provider" = String, Path, description = "Provider name"),
        ("method_id" = String, Path, description = "Provider-side payment method id")
    ),
    responses(
        (status = 204, description = "Method detached"),
        (status = 400, description = "Provider does not support saved methods", body = ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn detach_method(
    State(state): State<AppState>,
    _user: AuthUser,
    Path((provider, method_id)): Path<(String, String)>,
) -> Result<StatusCode, ServiceError> {
    state
        .services
        .payments
        .detach_payment_method(parse_provider(&provider)?, &method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
