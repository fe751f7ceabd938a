//! Route table.

pub mod admin;
pub mod subscription;
pub mod webhooks;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
    }
}

pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/users/{user_id}/subscription",
            post(admin::grant_subscription),
        )
        .route(
            "/users/{user_id}/subscription/extend",
            post(admin::extend_subscription),
        )
        .route(
            "/users/{user_id}/subscription/sync",
            post(admin::sync_subscription),
        )
        .route(
            "/settings/show-pro-to-all",
            get(admin::get_show_pro_to_all).put(admin::set_show_pro_to_all),
        )
        .route("/reconcile", post(admin::run_reconciliation))
        .route("/audit", get(admin::list_audit))
        .layer(middleware::from_fn(require_admin));

    let protected = Router::new()
        .route("/entitlement", get(subscription::get_entitlement))
        .route("/subscription", get(subscription::get_subscription))
        .route(
            "/subscription/cancel",
            post(subscription::cancel_subscription),
        )
        .route(
            "/subscription/reactivate",
            post(subscription::reactivate_subscription),
        )
        .nest("/admin", admin_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .nest("/v1", protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}
