//! External billing provider abstraction and its Stripe implementation.
//!
//! The provider is the source of truth for billing facts (status, period
//! boundaries, price). Services talk to the `BillingProvider` trait; the
//! `StripeGateway` implements it over `async-stripe` with exponential
//! backoff on transient failures.

use async_trait::async_trait;
use promptsouq_shared::{BillingInterval, SubscriptionStatus};
use stripe::{
    RecurringInterval, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Authoritative snapshot of a subscription as the provider sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub price_id: Option<String>,
    pub interval: Option<BillingInterval>,
}

/// The external billing system, reduced to the three calls the core needs.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch the authoritative state of a subscription.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Flag the subscription for cancellation at period end.
    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()>;

    /// Undo a pending cancellation.
    async fn reactivate(&self, subscription_id: &str) -> BillingResult<()>;
}

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_pro_monthly: Option<String>,
    pub price_pro_quarterly: Option<String>,
    pub price_pro_annual: Option<String>,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").ok(),
            price_pro_quarterly: std::env::var("STRIPE_PRICE_PRO_QUARTERLY").ok(),
            price_pro_annual: std::env::var("STRIPE_PRICE_PRO_ANNUAL").ok(),
        })
    }

    /// Map a configured price id back to its billing interval.
    pub fn interval_for_price_id(&self, price_id: &str) -> Option<BillingInterval> {
        if self.price_pro_monthly.as_deref() == Some(price_id) {
            Some(BillingInterval::Monthly)
        } else if self.price_pro_quarterly.as_deref() == Some(price_id) {
            Some(BillingInterval::Quarterly)
        } else if self.price_pro_annual.as_deref() == Some(price_id) {
            Some(BillingInterval::Annual)
        } else {
            None
        }
    }
}

fn map_subscription_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

/// Stripe reports quarterly plans as month-intervals with a count of 3.
fn map_recurring_interval(interval: RecurringInterval, count: u64) -> Option<BillingInterval> {
    match (interval, count) {
        (RecurringInterval::Month, 3) => Some(BillingInterval::Quarterly),
        (RecurringInterval::Month, _) => Some(BillingInterval::Monthly),
        (RecurringInterval::Year, _) => Some(BillingInterval::Annual),
        _ => None,
    }
}

fn map_stripe_error(e: stripe::StripeError) -> BillingError {
    match e {
        stripe::StripeError::Stripe(ref req) => match req.http_status {
            404 => BillingError::NotFound("subscription not found in Stripe".to_string()),
            408 | 409 | 429 | 500..=599 => BillingError::provider_transient(e.to_string()),
            _ => BillingError::provider_permanent(e.to_string()),
        },
        stripe::StripeError::Timeout | stripe::StripeError::ClientError(_) => {
            BillingError::provider_transient(e.to_string())
        }
        _ => BillingError::provider_permanent(e.to_string()),
    }
}

fn snapshot(sub: &Subscription, config: &StripeConfig) -> ProviderSubscription {
    let price = sub.items.data.first().and_then(|item| item.price.as_ref());
    let price_id = price.map(|p| p.id.to_string());

    let interval = price
        .and_then(|p| p.recurring.as_ref())
        .and_then(|r| map_recurring_interval(r.interval, r.interval_count))
        .or_else(|| {
            price_id
                .as_deref()
                .and_then(|id| config.interval_for_price_id(id))
        });

    ProviderSubscription {
        status: map_subscription_status(sub.status),
        cancel_at_period_end: sub.cancel_at_period_end,
        current_period_start: OffsetDateTime::from_unix_timestamp(sub.current_period_start)
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        current_period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end)
            .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        price_id,
        interval,
    }
}

/// Retry strategy for transient Stripe failures: 3 attempts, jittered
/// exponential backoff starting at 250ms.
fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(250).map(jitter).take(3)
}

/// `BillingProvider` over the real Stripe API.
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn parse_id(&self, subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id.parse::<SubscriptionId>().map_err(|e| {
            BillingError::Validation(format!(
                "invalid Stripe subscription id '{}': {}",
                subscription_id, e
            ))
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let sub_id = self.parse_id(subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        Subscription::update(&self.client, &sub_id, params)
            .await
            .map_err(map_stripe_error)?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel,
            "Updated cancellation flag in Stripe"
        );
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for StripeGateway {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = self.parse_id(subscription_id)?;

        let sub = RetryIf::spawn(
            retry_strategy(),
            || async {
                Subscription::retrieve(&self.client, &sub_id, &[])
                    .await
                    .map_err(map_stripe_error)
            },
            |e: &BillingError| e.is_transient(),
        )
        .await?;

        Ok(snapshot(&sub, &self.config))
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        self.set_cancel_at_period_end(subscription_id, true).await
    }

    async fn reactivate(&self, subscription_id: &str) -> BillingResult<()> {
        self.set_cancel_at_period_end(subscription_id, false).await
    }
}
