//! HTTP error mapping for the billing error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use promptsouq_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, retryable) = match &self {
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone(), false)
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), false),
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
                true,
            ),
            ApiError::Billing(e) => match e {
                BillingError::NotFound(msg) => {
                    (StatusCode::NOT_FOUND, "not_found", msg.clone(), false)
                }
                BillingError::InvalidState(msg) => {
                    (StatusCode::CONFLICT, "invalid_state", msg.clone(), false)
                }
                BillingError::Validation(msg) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "validation_error",
                    msg.clone(),
                    false,
                ),
                BillingError::ConcurrentModification(msg) => {
                    (StatusCode::CONFLICT, "conflict", msg.clone(), true)
                }
                BillingError::Provider { message, transient } => {
                    // transient outages are retry-worthy; permanent
                    // rejections need investigation, not a retry
                    if *transient {
                        (StatusCode::BAD_GATEWAY, "provider_unavailable", message.clone(), true)
                    } else {
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "provider_error",
                            message.clone(),
                            false,
                        )
                    }
                }
                BillingError::WebhookSignatureInvalid => (
                    StatusCode::BAD_REQUEST,
                    "invalid_signature",
                    e.to_string(),
                    false,
                ),
                BillingError::Database(_) | BillingError::Config(_) => {
                    tracing::error!(error = %e, "Internal billing error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "internal server error".to_string(),
                        false,
                    )
                }
            },
        };

        let body = Json(json!({
            "error": code,
            "message": message,
            "retryable": retryable,
        }));
        (status, body).into_response()
    }
}
