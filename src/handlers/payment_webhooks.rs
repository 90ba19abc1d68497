use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use super::{parse_provider, AppState};
use crate::{
    entities::WebhookOutcome,
    errors::{ErrorResponse, ServiceError},
};

/// Acknowledgement returned to the provider
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/:provider", post(receive_webhook))
}

/// Provider callback. The raw body is needed for signature verification.
///
/// Any authenticated delivery is acknowledged with 200, whatever its
/// outcome, so the provider does not retry deliveries that can never apply.
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/{provider}",
    params(("provider" = String, Path, description = "stripe or paypal")),
    request_body(content = String, description = "Raw provider payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Delivery recorded", body = WebhookAck),
        (status = 400, description = "Provider not configured", body = ErrorResponse),
        (status = 401, description = "Signature verification failed", body = ErrorResponse),
        (status = 404, description = "Unknown provider", body = ErrorResponse)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let provider = parse_provider(&provider)?;
    let outcome = state
        .services
        .reconciler
        .handle(provider, &headers, &body)
        .await?;

    info!(provider = %provider, outcome = ?outcome, "webhook acknowledged");
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
