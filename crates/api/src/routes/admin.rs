//! Administrative subscription and settings endpoints.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use promptsouq_billing::{
    Actor, AuditRecord, BillingError, FieldDrift, GrantParams, ReconcileMode, ReconcileOptions,
    ReconcileSummary, SyncOutcome,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::routes::subscription::SubscriptionView;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct GrantRequest {
    #[serde(default = "default_plan")]
    pub plan: String,
    pub interval: String,
    pub days: i64,
}

fn default_plan() -> String {
    "pro".to_string()
}

/// POST /v1/admin/users/{user_id}/subscription
pub async fn grant_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<GrantRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing_service()?;
    let interval = request.interval.parse().map_err(BillingError::from)?;

    let record = billing
        .subscriptions
        .grant(
            user_id,
            GrantParams {
                plan: request.plan,
                interval,
                days: request.days,
            },
            Actor::admin(admin.user_id),
        )
        .await?;
    Ok(Json(SubscriptionView::from(&record)))
}

#[derive(Deserialize)]
pub struct ExtendRequest {
    pub days: i64,
    #[serde(default)]
    pub reactivate: bool,
}

/// POST /v1/admin/users/{user_id}/subscription/extend
pub async fn extend_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<ExtendRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing_service()?;
    let record = billing
        .subscriptions
        .extend(
            user_id,
            request.days,
            request.reactivate,
            Actor::admin(admin.user_id),
        )
        .await?;
    Ok(Json(SubscriptionView::from(&record)))
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub applied: bool,
    pub drift: Vec<FieldDrift>,
    pub subscription: SubscriptionView,
}

/// POST /v1/admin/users/{user_id}/subscription/sync
pub async fn sync_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    let billing = state.billing_service()?;
    let outcome = billing
        .subscriptions
        .sync_for_user(user_id, Actor::admin(admin.user_id))
        .await?;

    let response = match outcome {
        SyncOutcome::Clean { ref record } => SyncResponse {
            applied: false,
            drift: Vec::new(),
            subscription: SubscriptionView::from(record),
        },
        SyncOutcome::Applied {
            ref record,
            ref drift,
        } => SyncResponse {
            applied: true,
            drift: drift.clone(),
            subscription: SubscriptionView::from(record),
        },
    };
    Ok(Json(response))
}

#[derive(Serialize)]
pub struct SettingResponse {
    pub enabled: bool,
}

/// GET /v1/admin/settings/show-pro-to-all
pub async fn get_show_pro_to_all(
    State(state): State<AppState>,
) -> ApiResult<Json<SettingResponse>> {
    let billing = state.billing_service()?;
    let enabled = billing.settings.show_pro_to_all().await?;
    Ok(Json(SettingResponse { enabled }))
}

#[derive(Deserialize)]
pub struct SettingRequest {
    pub enabled: bool,
}

/// PUT /v1/admin/settings/show-pro-to-all
pub async fn set_show_pro_to_all(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(request): Json<SettingRequest>,
) -> ApiResult<Json<SettingResponse>> {
    let billing = state.billing_service()?;
    billing
        .settings
        .set_show_pro_to_all(request.enabled, Actor::admin(admin.user_id))
        .await?;
    Ok(Json(SettingResponse {
        enabled: request.enabled,
    }))
}

#[derive(Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub fix: bool,
    #[serde(default)]
    pub verbose: bool,
}

/// POST /v1/admin/reconcile
pub async fn run_reconciliation(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> ApiResult<Json<ReconcileSummary>> {
    let billing = state.billing_service()?;
    let mode = if request.fix {
        ReconcileMode::Fix
    } else {
        ReconcileMode::DryRun
    };
    let summary = billing
        .reconciliation
        .run(ReconcileOptions {
            mode,
            verbose: request.verbose,
        })
        .await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_entity_type() -> String {
    "subscription".to_string()
}

fn default_audit_limit() -> i64 {
    50
}

/// GET /v1/admin/audit
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    let billing = state.billing_service()?;
    let records = billing
        .audit_trail(&query.entity_type, &query.entity_id, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(records))
}
