use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "message": "Invalid transition: pending -> shipped",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The acting user does not own the resource.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Missing or invalid credentials.
    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Refund of {requested} exceeds remaining refundable amount {remaining}")]
    InsufficientRefundableAmount {
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Payment provider error: {0}")]
    ProviderError(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::ProviderError("payment provider timed out".to_string())
        } else {
            ServiceError::ProviderError(err.to_string())
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AuthError(_) | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::ValidationError(_) | Self::EmptyCart | Self::NotSupported(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidTransition { .. }
            | Self::ConcurrentModification(_)
            | Self::ReconciliationConflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) | Self::InsufficientRefundableAmount { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            // Provider failures are a recoverable payment outcome, not a server fault.
            Self::ProviderError(_) => StatusCode::PAYMENT_REQUIRED,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::ProviderError(_) => "Payment could not be processed".to_string(),
            _ => self.to_string(),
        }
    }

    /// Machine-readable error kind, used for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::AuthError(_) => "auth",
            Self::Forbidden(_) => "forbidden",
            Self::ValidationError(_) => "validation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::EmptyCart => "empty_cart",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::InsufficientRefundableAmount { .. } => "insufficient_refundable_amount",
            Self::ProviderError(_) => "provider",
            Self::InvalidSignature => "invalid_signature",
            Self::NotSupported(_) => "not_supported",
            Self::ReconciliationConflict(_) => "reconciliation_conflict",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::InternalError(_) | Self::Other(_) => "internal",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
