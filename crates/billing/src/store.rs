//! Persistence traits and their Postgres implementation.
//!
//! Services depend on the traits, never on `PgPool` directly, so the
//! lifecycle and reconciliation logic runs against in-memory fakes in tests.
//! Every subscription write is compare-and-swap on the `version` column:
//! the caller passes the row it read, and the update only lands if nobody
//! else has written since.

use async_trait::async_trait;
use promptsouq_shared::{BillingInterval, SubscriptionStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::{BillingError, BillingResult};

/// A subscription row. `version` is the optimistic-lock counter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan: String,
    pub billing_interval: BillingInterval,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields for inserting a fresh subscription row.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan: String,
    pub billing_interval: BillingInterval,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_price_id: Option<String>,
}

/// A persisted audit entry, as read back for admin review.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn user_exists(&self, user_id: Uuid) -> BillingResult<bool>;

    /// The subscription of record: most recent `created_at`, id as tiebreak.
    async fn find_latest_for_user(&self, user_id: Uuid)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_billing_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// All rows eligible for reconciliation (non-null billing reference).
    async fn list_with_billing_ref(&self) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn insert(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord>;

    /// Compare-and-swap write. `record.version` must match the stored row;
    /// on success the returned row carries `version + 1`.
    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()>;

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<AuditRecord>>;
}

#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn get(&self, key: &str) -> BillingResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim exclusive processing rights for an event.
    /// Returns false if another worker already holds or completed it.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()>;
}

/// Events stuck in `processing` longer than this are re-claimable.
const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

fn decode_subscription_row(row: &PgRow) -> Result<SubscriptionRecord, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status: SubscriptionStatus =
        status_raw
            .parse()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?;

    let interval_raw: String = row.try_get("billing_interval")?;
    let billing_interval: BillingInterval =
        interval_raw
            .parse()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "billing_interval".to_string(),
                source: Box::new(e),
            })?;

    Ok(SubscriptionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status,
        plan: row.try_get("plan")?,
        billing_interval,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        stripe_price_id: row.try_get("stripe_price_id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl<'r> sqlx::FromRow<'r, PgRow> for SubscriptionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        decode_subscription_row(row)
    }
}

/// Postgres-backed implementation of every storage trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn user_exists(&self, user_id: Uuid) -> BillingResult<bool> {
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exists.is_some())
    }

    async fn find_latest_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_by_billing_ref(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_with_billing_ref(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscriptions
            WHERE stripe_subscription_id IS NOT NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn insert(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            INSERT INTO subscriptions
                (user_id, status, plan, billing_interval,
                 current_period_start, current_period_end, cancel_at_period_end,
                 stripe_subscription_id, stripe_customer_id, stripe_price_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(new.status.as_str())
        .bind(&new.plan)
        .bind(new.billing_interval.as_str())
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(new.cancel_at_period_end)
        .bind(&new.stripe_subscription_id)
        .bind(&new.stripe_customer_id)
        .bind(&new.stripe_price_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let updated = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            UPDATE subscriptions SET
                status = $1,
                plan = $2,
                billing_interval = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                stripe_subscription_id = $7,
                stripe_customer_id = $8,
                stripe_price_id = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $10 AND version = $11
            RETURNING *
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.plan)
        .bind(record.billing_interval.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(&record.stripe_subscription_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_price_id)
        .bind(record.id)
        .bind(record.version)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                record.id
            ))
        })
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log
                (actor_id, actor_type, action, entity_type, entity_id, details)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.actor_id)
        .bind(entry.actor_type.as_str())
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT * FROM audit_log
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl SettingStore for PgStore {
    async fn get(&self, key: &str) -> BillingResult<Option<String>> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT...ON CONFLICT...RETURNING: only one concurrent request can
        // claim processing rights. Events stuck in 'processing' past the
        // timeout are re-claimable.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events
                (stripe_event_id, event_type, event_timestamp,
                 processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE billing_webhook_events.processing_result = 'processing'
              AND billing_webhook_events.processing_started_at
                    < NOW() - make_interval(mins => $4)
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(outcome)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
