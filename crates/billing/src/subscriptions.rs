//! Subscription lifecycle operations.
//!
//! Every mutation of a subscription row goes through this service: admin
//! grant, self-service cancel/reactivate, admin extend, and sync from the
//! billing provider. Each operation checks its precondition, pushes any
//! required change to the provider BEFORE touching the local row, writes
//! via compare-and-swap, and appends exactly one audit entry.

use std::sync::Arc;

use promptsouq_shared::{BillingInterval, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{Actor, AuditEntry, AuditLogger};
use crate::client::BillingProvider;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{apply_remote, compute_drift, FieldDrift};
use crate::store::{NewSubscription, SubscriptionRecord, SubscriptionStore};

/// Parameters for an admin-initiated grant.
#[derive(Debug, Clone)]
pub struct GrantParams {
    pub plan: String,
    pub interval: BillingInterval,
    /// Length of the granted period in days, starting now.
    pub days: i64,
}

/// Result of a sync against the billing provider.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Local row already matched the provider; nothing written.
    Clean { record: SubscriptionRecord },
    /// Drift found and overwritten from the provider.
    Applied {
        record: SubscriptionRecord,
        drift: Vec<FieldDrift>,
    },
}

impl SyncOutcome {
    pub fn record(&self) -> &SubscriptionRecord {
        match self {
            SyncOutcome::Clean { record } => record,
            SyncOutcome::Applied { record, .. } => record,
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    audit: AuditLogger,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            provider,
            audit,
        }
    }

    /// The user's subscription of record (most recently created row).
    pub async fn subscription_of_record(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_latest_for_user(user_id).await
    }

    async fn require_subscription(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.store
            .find_latest_for_user(user_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no subscription found for user {}", user_id))
            })
    }

    /// Grant (or overwrite) a subscription for a user.
    ///
    /// Upsert semantics: an existing row is overwritten in place, never
    /// appended to. Manually granted rows carry no Stripe identifiers.
    pub async fn grant(
        &self,
        user_id: Uuid,
        params: GrantParams,
        actor: Actor,
    ) -> BillingResult<SubscriptionRecord> {
        if params.days <= 0 {
            return Err(BillingError::Validation(
                "grant period must be a positive number of days".to_string(),
            ));
        }
        if !self.store.user_exists(user_id).await? {
            return Err(BillingError::NotFound(format!("user {} not found", user_id)));
        }

        let now = OffsetDateTime::now_utc();
        let period_end = now + Duration::days(params.days);

        let existing = self.store.find_latest_for_user(user_id).await?;
        let previous = existing.as_ref().map(|s| {
            serde_json::json!({
                "status": s.status,
                "plan": s.plan,
                "current_period_end": s.current_period_end,
            })
        });

        let record = match existing {
            Some(mut sub) => {
                sub.status = SubscriptionStatus::Active;
                sub.plan = params.plan.clone();
                sub.billing_interval = params.interval;
                sub.current_period_start = now;
                sub.current_period_end = period_end;
                sub.cancel_at_period_end = false;
                self.store.update(&sub).await?
            }
            None => {
                self.store
                    .insert(NewSubscription {
                        user_id,
                        status: SubscriptionStatus::Active,
                        plan: params.plan.clone(),
                        billing_interval: params.interval,
                        current_period_start: now,
                        current_period_end: period_end,
                        cancel_at_period_end: false,
                        stripe_subscription_id: None,
                        stripe_customer_id: None,
                        stripe_price_id: None,
                    })
                    .await?
            }
        };

        self.audit
            .append(
                AuditEntry::new("subscription.granted", "subscription", record.id)
                    .actor(actor)
                    .details(serde_json::json!({
                        "user_id": user_id,
                        "plan": params.plan,
                        "interval": params.interval,
                        "days": params.days,
                        "previous": previous,
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.id,
            plan = %record.plan,
            days = params.days,
            "Granted subscription"
        );
        Ok(record)
    }

    /// Schedule cancellation at period end.
    ///
    /// Rejected (not silently ignored) if a cancellation is already
    /// pending. For rows with a billing reference the provider is updated
    /// first; the local flag flips only after external confirmation.
    pub async fn cancel(&self, user_id: Uuid, actor: Actor) -> BillingResult<SubscriptionRecord> {
        let mut sub = self.require_subscription(user_id).await?;

        if sub.cancel_at_period_end {
            return Err(BillingError::InvalidState(
                "subscription is already scheduled for cancellation".to_string(),
            ));
        }

        if let Some(ref stripe_id) = sub.stripe_subscription_id {
            self.provider.cancel_at_period_end(stripe_id).await?;
        }

        sub.cancel_at_period_end = true;
        let updated = self.store.update(&sub).await?;

        self.audit
            .append(
                AuditEntry::new("subscription.cancel_scheduled", "subscription", updated.id)
                    .actor(actor)
                    .details(serde_json::json!({
                        "user_id": user_id,
                        "stripe_subscription_id": updated.stripe_subscription_id,
                        "effective_at": updated.current_period_end,
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            effective_at = %updated.current_period_end,
            "Scheduled subscription cancellation at period end"
        );
        Ok(updated)
    }

    /// Undo a pending cancellation. Rejected if none is pending.
    pub async fn reactivate(
        &self,
        user_id: Uuid,
        actor: Actor,
    ) -> BillingResult<SubscriptionRecord> {
        let mut sub = self.require_subscription(user_id).await?;

        if !sub.cancel_at_period_end {
            return Err(BillingError::InvalidState(
                "subscription is not scheduled for cancellation".to_string(),
            ));
        }

        if let Some(ref stripe_id) = sub.stripe_subscription_id {
            self.provider.reactivate(stripe_id).await?;
        }

        sub.cancel_at_period_end = false;
        let updated = self.store.update(&sub).await?;

        self.audit
            .append(
                AuditEntry::new("subscription.reactivated", "subscription", updated.id)
                    .actor(actor)
                    .details(serde_json::json!({
                        "user_id": user_id,
                        "stripe_subscription_id": updated.stripe_subscription_id,
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            "Reactivated subscription"
        );
        Ok(updated)
    }

    /// Add days on top of the existing `current_period_end`.
    ///
    /// The extension stacks on whatever end date is already there, even if
    /// it lies in the past; it is never computed from "now". With
    /// `reactivate` set, a canceled row is also restored to active.
    pub async fn extend(
        &self,
        user_id: Uuid,
        days: i64,
        reactivate: bool,
        actor: Actor,
    ) -> BillingResult<SubscriptionRecord> {
        if days <= 0 {
            return Err(BillingError::Validation(
                "extension must be a positive number of days".to_string(),
            ));
        }

        let mut sub = self.require_subscription(user_id).await?;
        let previous_end = sub.current_period_end;
        sub.current_period_end = previous_end + Duration::days(days);

        let mut reactivated = false;
        if reactivate && sub.status == SubscriptionStatus::Canceled {
            sub.status = SubscriptionStatus::Active;
            sub.cancel_at_period_end = false;
            reactivated = true;
        }

        let updated = self.store.update(&sub).await?;

        self.audit
            .append(
                AuditEntry::new("subscription.extended", "subscription", updated.id)
                    .actor(actor)
                    .details(serde_json::json!({
                        "user_id": user_id,
                        "days": days,
                        "previous_period_end": previous_end,
                        "new_period_end": updated.current_period_end,
                        "reactivated": reactivated,
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            days = days,
            new_period_end = %updated.current_period_end,
            reactivated = reactivated,
            "Extended subscription"
        );
        Ok(updated)
    }

    /// Sync the user's subscription of record from the billing provider.
    pub async fn sync_for_user(&self, user_id: Uuid, actor: Actor) -> BillingResult<SyncOutcome> {
        let sub = self.require_subscription(user_id).await?;
        self.sync_record(&sub, actor).await
    }

    /// Overwrite local billing fields with the provider's authoritative
    /// state. Rows without a billing reference are not eligible. A fetch
    /// failure leaves the local row untouched; a no-drift sync writes and
    /// audits nothing, so repeated syncs are stable.
    pub async fn sync_record(
        &self,
        sub: &SubscriptionRecord,
        actor: Actor,
    ) -> BillingResult<SyncOutcome> {
        let stripe_id = sub.stripe_subscription_id.clone().ok_or_else(|| {
            BillingError::InvalidState(format!(
                "subscription {} has no billing reference and is not eligible for sync",
                sub.id
            ))
        })?;

        let remote = self.provider.retrieve_subscription(&stripe_id).await?;
        let drift = compute_drift(sub, &remote);

        if drift.is_empty() {
            tracing::debug!(subscription_id = %sub.id, "Sync found no drift");
            return Ok(SyncOutcome::Clean {
                record: sub.clone(),
            });
        }

        let updated = self
            .store
            .update(&apply_remote(sub.clone(), &remote))
            .await?;

        self.audit
            .append(
                AuditEntry::new("subscription.synced", "subscription", updated.id)
                    .actor(actor)
                    .details(serde_json::json!({
                        "user_id": updated.user_id,
                        "stripe_subscription_id": stripe_id,
                        "changes": drift,
                    })),
            )
            .await?;

        tracing::info!(
            subscription_id = %updated.id,
            user_id = %updated.user_id,
            fields = drift.len(),
            "Synced subscription from billing provider"
        );
        Ok(SyncOutcome::Applied {
            record: updated,
            drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        provider_snapshot, service_with, test_record, MemoryStore, MockProvider,
    };

    fn active_user(store: &MemoryStore) -> Uuid {
        let user_id = Uuid::new_v4();
        store.add_user(user_id);
        user_id
    }

    #[tokio::test]
    async fn grant_creates_row_for_new_user() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let params = GrantParams {
            plan: "pro".to_string(),
            interval: BillingInterval::Monthly,
            days: 30,
        };
        let record = service
            .grant(user_id, params, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(record.status, SubscriptionStatus::Active);
        assert!(!record.cancel_at_period_end);
        assert!(record.stripe_subscription_id.is_none());
        let period = record.current_period_end - record.current_period_start;
        assert_eq!(period.whole_days(), 30);

        let audits = store.audit_entries();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "subscription.granted");
    }

    #[tokio::test]
    async fn grant_overwrites_existing_row_instead_of_appending() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut existing = test_record(user_id);
        existing.status = SubscriptionStatus::Canceled;
        existing.cancel_at_period_end = true;
        store.seed_subscription(existing.clone());

        let record = service
            .grant(
                user_id,
                GrantParams {
                    plan: "pro".to_string(),
                    interval: BillingInterval::Annual,
                    days: 365,
                },
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap();

        assert_eq!(record.id, existing.id);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.billing_interval, BillingInterval::Annual);
        assert!(!record.cancel_at_period_end);
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn grant_unknown_user_is_not_found() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());

        let err = service
            .grant(
                Uuid::new_v4(),
                GrantParams {
                    plan: "pro".to_string(),
                    interval: BillingInterval::Monthly,
                    days: 30,
                },
                Actor::admin(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn cancel_pushes_to_provider_then_updates_local_row() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        provider.seed_remote("sub_1", provider_snapshot(&record));
        store.seed_subscription(record);

        let updated = service.cancel(user_id, Actor::user(user_id)).await.unwrap();

        assert!(updated.cancel_at_period_end);
        assert_eq!(provider.cancel_calls(), vec!["sub_1".to_string()]);
        let audits = store.audit_entries();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action, "subscription.cancel_scheduled");
    }

    #[tokio::test]
    async fn cancel_when_already_pending_is_rejected_without_side_effects() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.cancel_at_period_end = true;
        store.seed_subscription(record);

        let err = service
            .cancel(user_id, Actor::user(user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert_eq!(
            err.to_string(),
            "subscription is already scheduled for cancellation"
        );
        // no external call, no audit entry
        assert!(provider.cancel_calls().is_empty());
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn cancel_without_subscription_is_not_found() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let err = service
            .cancel(user_id, Actor::user(user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn provider_failure_leaves_cancel_unapplied() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        provider.fail_transient("sub_1");
        store.seed_subscription(record.clone());

        let err = service
            .cancel(user_id, Actor::user(user_id))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // local row untouched, nothing audited
        let current = store.get_subscription(record.id).unwrap();
        assert!(!current.cancel_at_period_end);
        assert_eq!(current.version, record.version);
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn cancel_without_billing_ref_flips_locally() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.stripe_subscription_id = None;
        store.seed_subscription(record);

        let updated = service.cancel(user_id, Actor::user(user_id)).await.unwrap();
        assert!(updated.cancel_at_period_end);
        // manual grant: nothing external to call
        assert!(provider.cancel_calls().is_empty());
    }

    #[tokio::test]
    async fn reactivate_when_not_pending_is_rejected() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        store.seed_subscription(test_record(user_id));

        let err = service
            .reactivate(user_id, Actor::user(user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert!(provider.reactivate_calls().is_empty());
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn reactivate_clears_pending_cancellation() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.cancel_at_period_end = true;
        provider.seed_remote("sub_1", provider_snapshot(&record));
        store.seed_subscription(record);

        let updated = service
            .reactivate(user_id, Actor::user(user_id))
            .await
            .unwrap();
        assert!(!updated.cancel_at_period_end);
        assert_eq!(provider.reactivate_calls(), vec!["sub_1".to_string()]);
        assert_eq!(store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn extend_stacks_on_existing_period_end() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        let prior_end = record.current_period_end;
        store.seed_subscription(record);

        let updated = service
            .extend(user_id, 14, false, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();

        // relative to the prior end, never to "now"
        assert_eq!(updated.current_period_end, prior_end + Duration::days(14));
    }

    #[tokio::test]
    async fn extend_stacks_even_when_period_already_lapsed() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.current_period_end = OffsetDateTime::now_utc() - Duration::days(10);
        let prior_end = record.current_period_end;
        store.seed_subscription(record);

        let updated = service
            .extend(user_id, 7, false, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(updated.current_period_end, prior_end + Duration::days(7));
        // 10 days lapsed + 7 added: still in the past
        assert!(updated.current_period_end < OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn extend_with_reactivate_restores_canceled_row() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.status = SubscriptionStatus::Canceled;
        record.cancel_at_period_end = true;
        store.seed_subscription(record);

        let updated = service
            .extend(user_id, 30, true, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert!(!updated.cancel_at_period_end);
    }

    #[tokio::test]
    async fn extend_rejects_non_positive_days() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);
        store.seed_subscription(test_record(user_id));

        let err = service
            .extend(user_id, 0, false, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn sync_without_billing_ref_is_rejected() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let mut record = test_record(user_id);
        record.stripe_subscription_id = None;
        store.seed_subscription(record);

        let err = service
            .sync_for_user(user_id, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert!(err.to_string().contains("not eligible for sync"));
        assert!(provider.retrieve_calls().is_empty());
    }

    #[tokio::test]
    async fn sync_applies_remote_state_and_audits_changes() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        let mut remote = provider_snapshot(&record);
        remote.status = SubscriptionStatus::PastDue;
        remote.cancel_at_period_end = true;
        provider.seed_remote("sub_1", remote);
        store.seed_subscription(record);

        let outcome = service
            .sync_for_user(user_id, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();

        let SyncOutcome::Applied { record, drift } = outcome else {
            panic!("expected drift to be applied");
        };
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert!(record.cancel_at_period_end);
        assert_eq!(drift.len(), 2);
        assert_eq!(store.audit_entries().len(), 1);
        assert_eq!(store.audit_entries()[0].action, "subscription.synced");
    }

    #[tokio::test]
    async fn sync_is_idempotent_when_no_drift() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        provider.seed_remote("sub_1", provider_snapshot(&record));
        store.seed_subscription(record.clone());

        let first = service
            .sync_for_user(user_id, Actor::system())
            .await
            .unwrap();
        let second = service
            .sync_for_user(user_id, Actor::system())
            .await
            .unwrap();

        assert!(matches!(first, SyncOutcome::Clean { .. }));
        assert!(matches!(second, SyncOutcome::Clean { .. }));
        // no writes: version unchanged, no audit entries
        let current = store.get_subscription(record.id).unwrap();
        assert_eq!(current.version, record.version);
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn sync_fetch_failure_leaves_row_untouched() {
        let store = MemoryStore::shared();
        let provider = MockProvider::shared();
        let service = service_with(store.clone(), provider.clone());
        let user_id = active_user(&store);

        let record = test_record(user_id);
        provider.fail_transient("sub_1");
        store.seed_subscription(record.clone());

        let err = service
            .sync_for_user(user_id, Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let current = store.get_subscription(record.id).unwrap();
        assert_eq!(current.version, record.version);
        assert_eq!(current.status, record.status);
        assert!(store.audit_entries().is_empty());
    }
}
