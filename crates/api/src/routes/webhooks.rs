//! Stripe webhook intake endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use promptsouq_billing::BillingError;

use crate::error::ApiResult;
use crate::state::AppState;

/// POST /v1/webhooks/stripe
///
/// Verifies the signature against the raw body, then hands the event to
/// the idempotent handler. Processing errors return 5xx so Stripe retries.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let billing = state.billing_service()?;

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(BillingError::WebhookSignatureInvalid)?;

    let event = billing.webhooks.verify_event(&body, signature)?;
    billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
