// Billing crate clippy configuration
#![allow(clippy::result_large_err)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PromptSouq Billing Module
//!
//! Subscription entitlement and reconciliation for the prompt marketplace.
//!
//! ## Features
//!
//! - **Entitlement**: pure evaluator deciding Pro access from the
//!   subscription of record and the global override flag
//! - **Lifecycle**: grant, cancel, reactivate, extend, sync — each a
//!   guarded state transition with an audit trail
//! - **Reconciliation**: dry-run/fix scans that resolve drift against the
//!   billing provider, isolating per-row failures
//! - **Webhooks**: signature-verified, idempotent Stripe event intake
//! - **Settings**: the process-wide "show Pro to all" override

pub mod audit;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod reconcile;
pub mod settings;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod test_support;

// Audit
pub use audit::{Actor, ActorType, AuditEntry, AuditLogger};

// Client
pub use client::{BillingProvider, ProviderSubscription, StripeConfig, StripeGateway};

// Entitlement
pub use entitlement::{
    evaluate, EntitlementDecision, EntitlementReason, EntitlementService, INCOMPLETE_GRACE_WINDOW,
};

// Error
pub use error::{BillingError, BillingResult};

// Reconcile
pub use reconcile::{
    compute_drift, FieldDrift, ReconcileMode, ReconcileOptions, ReconcileSummary,
    ReconciliationEngine, RowOutcome, RowReport,
};

// Settings
pub use settings::{SettingsService, SHOW_PRO_TO_ALL_KEY};

// Store
pub use store::{
    AuditRecord, AuditSink, NewSubscription, PgStore, SettingStore, SubscriptionRecord,
    SubscriptionStore, WebhookEventStore,
};

// Subscriptions
pub use subscriptions::{GrantParams, SubscriptionService, SyncOutcome};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service combining entitlement, lifecycle, reconciliation,
/// and webhook handling over a shared store and provider.
pub struct BillingService {
    pub settings: SettingsService,
    pub entitlement: EntitlementService,
    pub subscriptions: SubscriptionService,
    pub reconciliation: ReconciliationEngine,
    pub webhooks: WebhookHandler,
    audit_reader: Arc<PgStore>,
}

impl BillingService {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = StripeGateway::from_env()?;
        Ok(Self::new(gateway, pool))
    }

    /// Create a billing service with an explicit Stripe gateway.
    pub fn new(gateway: StripeGateway, pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        let webhook_secret = gateway.config().webhook_secret.clone();
        let provider: Arc<dyn BillingProvider> = Arc::new(gateway);

        let audit = AuditLogger::new(store.clone());
        let settings = SettingsService::new(store.clone(), audit.clone());
        let entitlement = EntitlementService::new(store.clone(), settings.clone());
        let subscriptions =
            SubscriptionService::new(store.clone(), provider.clone(), audit.clone());
        let reconciliation =
            ReconciliationEngine::new(store.clone(), provider, subscriptions.clone());
        let webhooks = WebhookHandler::new(
            store.clone(),
            store.clone(),
            subscriptions.clone(),
            audit,
            webhook_secret,
        );

        Self {
            settings,
            entitlement,
            subscriptions,
            reconciliation,
            webhooks,
            audit_reader: store,
        }
    }

    /// Read the audit trail for one entity (admin review).
    pub async fn audit_trail(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<AuditRecord>> {
        self.audit_reader
            .list_for_entity(entity_type, entity_id, limit)
            .await
    }
}
