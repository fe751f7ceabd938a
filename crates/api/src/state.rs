//! Application state

use std::sync::Arc;

use promptsouq_billing::BillingService;
use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;
use crate::error::ApiError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Billing service; `None` when Stripe is not configured.
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, 24);

        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    /// Billing service, or a 503 for routes that need it.
    pub fn billing_service(&self) -> Result<&Arc<BillingService>, ApiError> {
        self.billing.as_ref().ok_or_else(|| {
            ApiError::ServiceUnavailable("billing is not configured".to_string())
        })
    }
}
