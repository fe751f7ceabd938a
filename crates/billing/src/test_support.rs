//! In-memory fakes shared by the unit tests in this crate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use promptsouq_shared::{BillingInterval, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger};
use crate::client::{BillingProvider, ProviderSubscription};
use crate::error::{BillingError, BillingResult};
use crate::store::{
    AuditRecord, AuditSink, NewSubscription, SettingStore, SubscriptionRecord, SubscriptionStore,
    WebhookEventStore,
};
use crate::subscriptions::SubscriptionService;

/// A subscription row with sensible defaults: active, monthly, period
/// running from 5 days ago to 25 days from now, linked to `sub_1`.
pub(crate) fn test_record(user_id: Uuid) -> SubscriptionRecord {
    let now = OffsetDateTime::now_utc();
    SubscriptionRecord {
        id: Uuid::new_v4(),
        user_id,
        status: SubscriptionStatus::Active,
        plan: "pro".to_string(),
        billing_interval: BillingInterval::Monthly,
        current_period_start: now - Duration::days(5),
        current_period_end: now + Duration::days(25),
        cancel_at_period_end: false,
        stripe_subscription_id: Some("sub_1".to_string()),
        stripe_customer_id: Some("cus_1".to_string()),
        stripe_price_id: Some("price_m".to_string()),
        version: 1,
        created_at: now - Duration::days(5),
        updated_at: now - Duration::days(5),
    }
}

/// Provider snapshot that exactly matches a local row (zero drift).
pub(crate) fn provider_snapshot(record: &SubscriptionRecord) -> ProviderSubscription {
    ProviderSubscription {
        status: record.status,
        cancel_at_period_end: record.cancel_at_period_end,
        current_period_start: record.current_period_start,
        current_period_end: record.current_period_end,
        price_id: record.stripe_price_id.clone(),
        interval: Some(record.billing_interval),
    }
}

pub(crate) fn service_with(
    store: Arc<MemoryStore>,
    provider: Arc<MockProvider>,
) -> SubscriptionService {
    SubscriptionService::new(
        store.clone(),
        provider,
        AuditLogger::new(store),
    )
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    users: Mutex<HashSet<Uuid>>,
    subs: Mutex<HashMap<Uuid, SubscriptionRecord>>,
    audit: Mutex<Vec<AuditEntry>>,
    settings: Mutex<HashMap<String, String>>,
    events: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_user(&self, id: Uuid) {
        self.users.lock().unwrap().insert(id);
    }

    pub fn seed_subscription(&self, record: SubscriptionRecord) {
        self.subs.lock().unwrap().insert(record.id, record);
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<SubscriptionRecord> {
        self.subs.lock().unwrap().get(&id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().clone()
    }

    pub fn event_result(&self, event_id: &str) -> Option<String> {
        self.events.lock().unwrap().get(event_id).cloned()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn user_exists(&self, user_id: Uuid) -> BillingResult<bool> {
        Ok(self.users.lock().unwrap().contains(&user_id))
    }

    async fn find_latest_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subs = self.subs.lock().unwrap();
        Ok(subs
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| (s.created_at, s.id))
            .cloned())
    }

    async fn find_by_billing_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subs = self.subs.lock().unwrap();
        Ok(subs
            .values()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn list_with_billing_ref(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let subs = self.subs.lock().unwrap();
        let mut records: Vec<_> = subs
            .values()
            .filter(|s| s.stripe_subscription_id.is_some())
            .cloned()
            .collect();
        records.sort_by_key(|s| (s.created_at, s.id));
        Ok(records)
    }

    async fn insert(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            status: new.status,
            plan: new.plan,
            billing_interval: new.billing_interval,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            cancel_at_period_end: new.cancel_at_period_end,
            stripe_subscription_id: new.stripe_subscription_id,
            stripe_customer_id: new.stripe_customer_id,
            stripe_price_id: new.stripe_price_id,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.subs.lock().unwrap().insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let mut subs = self.subs.lock().unwrap();
        let existing = subs.get_mut(&record.id).ok_or_else(|| {
            BillingError::NotFound(format!("subscription {} not found", record.id))
        })?;
        if existing.version != record.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                record.id
            )));
        }
        let mut updated = record.clone();
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        *existing = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        self.audit.lock().unwrap().push(entry);
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<AuditRecord>> {
        let audit = self.audit.lock().unwrap();
        Ok(audit
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .take(limit as usize)
            .map(|e| AuditRecord {
                id: Uuid::new_v4(),
                actor_id: e.actor_id,
                actor_type: e.actor_type.as_str().to_string(),
                action: e.action.clone(),
                entity_type: e.entity_type.clone(),
                entity_id: e.entity_id.clone(),
                details: e.details.clone(),
                created_at: OffsetDateTime::now_utc(),
            })
            .collect())
    }
}

#[async_trait]
impl SettingStore for MemoryStore {
    async fn get(&self, key: &str) -> BillingResult<Option<String>> {
        Ok(self.settings.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BillingResult<()> {
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut events = self.events.lock().unwrap();
        if events.contains_key(event_id) {
            return Ok(false);
        }
        events.insert(event_id.to_string(), "processing".to_string());
        Ok(true)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: &str,
        _error: Option<&str>,
    ) -> BillingResult<()> {
        self.events
            .lock()
            .unwrap()
            .insert(event_id.to_string(), outcome.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockProvider {
    remote: Mutex<HashMap<String, ProviderSubscription>>,
    transient_failures: Mutex<HashSet<String>>,
    retrieve_log: Mutex<Vec<String>>,
    cancel_log: Mutex<Vec<String>>,
    reactivate_log: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_remote(&self, subscription_id: &str, snapshot: ProviderSubscription) {
        self.remote
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), snapshot);
    }

    /// Make every call against this subscription id fail transiently.
    pub fn fail_transient(&self, subscription_id: &str) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(subscription_id.to_string());
    }

    pub fn retrieve_calls(&self) -> Vec<String> {
        self.retrieve_log.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.cancel_log.lock().unwrap().clone()
    }

    pub fn reactivate_calls(&self) -> Vec<String> {
        self.reactivate_log.lock().unwrap().clone()
    }

    fn check_failure(&self, subscription_id: &str) -> BillingResult<()> {
        if self
            .transient_failures
            .lock()
            .unwrap()
            .contains(subscription_id)
        {
            return Err(BillingError::provider_transient("simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for MockProvider {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.retrieve_log
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        self.check_failure(subscription_id)?;
        self.remote
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "subscription {} not found in provider",
                    subscription_id
                ))
            })
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        self.cancel_log
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        self.check_failure(subscription_id)?;
        if let Some(remote) = self.remote.lock().unwrap().get_mut(subscription_id) {
            remote.cancel_at_period_end = true;
        }
        Ok(())
    }

    async fn reactivate(&self, subscription_id: &str) -> BillingResult<()> {
        self.reactivate_log
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        self.check_failure(subscription_id)?;
        if let Some(remote) = self.remote.lock().unwrap().get_mut(subscription_id) {
            remote.cancel_at_period_end = false;
        }
        Ok(())
    }
}
