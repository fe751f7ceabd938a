//! Self-service subscription endpoints.

use axum::extract::State;
use axum::{Extension, Json};
use promptsouq_billing::{Actor, EntitlementReason, SubscriptionRecord};
use promptsouq_shared::{BillingInterval, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// Subscription fields exposed over the API.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub plan: String,
    pub status: SubscriptionStatus,
    pub billing_interval: BillingInterval,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub stripe_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl From<&SubscriptionRecord> for SubscriptionView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            id: record.id,
            plan: record.plan.clone(),
            status: record.status,
            billing_interval: record.billing_interval,
            current_period_start: record.current_period_start,
            current_period_end: record.current_period_end,
            cancel_at_period_end: record.cancel_at_period_end,
            stripe_subscription_id: record.stripe_subscription_id.clone(),
            created_at: record.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct EntitlementResponse {
    pub entitled: bool,
    pub reason: EntitlementReason,
}

/// GET /v1/entitlement
pub async fn get_entitlement(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementResponse>> {
    let billing = state.billing_service()?;
    let decision = billing.entitlement.check(user.user_id).await?;
    Ok(Json(EntitlementResponse {
        entitled: decision.entitled,
        reason: decision.reason,
    }))
}

/// GET /v1/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Option<SubscriptionView>>> {
    let billing = state.billing_service()?;
    let record = billing
        .subscriptions
        .subscription_of_record(user.user_id)
        .await?;
    Ok(Json(record.as_ref().map(SubscriptionView::from)))
}

/// POST /v1/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing_service()?;
    let record = billing
        .subscriptions
        .cancel(user.user_id, Actor::user(user.user_id))
        .await?;
    Ok(Json(SubscriptionView::from(&record)))
}

/// POST /v1/subscription/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing_service()?;
    let record = billing
        .subscriptions
        .reactivate(user.user_id, Actor::user(user.user_id))
        .await?;
    Ok(Json(SubscriptionView::from(&record)))
}
