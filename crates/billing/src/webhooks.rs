//! Stripe webhook handling.
//!
//! Webhooks are treated as hints: the event supplies a subscription
//! identifier and an event type, and the handler pull-reconciles the
//! referenced row from the provider rather than trusting the (possibly
//! stale) event payload. Processing is idempotent: each event id is
//! claimed atomically before any work happens, so duplicate deliveries
//! and concurrent workers cannot double-process.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{CheckoutSession, Event, EventObject, EventType, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{Actor, AuditEntry, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::store::{NewSubscription, SubscriptionStore, WebhookEventStore};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Reject events whose signature timestamp is older than this.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header against the raw payload.
///
/// Manual implementation of Stripe's v1 scheme, used as a fallback when
/// `async-stripe`'s parser rejects a newer API version. `now_unix` is a
/// parameter so tolerance checks are testable.
fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    // Header format: t=timestamp,v1=signature,v0=signature
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

pub struct WebhookHandler {
    events: Arc<dyn WebhookEventStore>,
    store: Arc<dyn SubscriptionStore>,
    subscriptions: SubscriptionService,
    audit: AuditLogger,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        events: Arc<dyn WebhookEventStore>,
        store: Arc<dyn SubscriptionStore>,
        subscriptions: SubscriptionService,
        audit: AuditLogger,
        webhook_secret: String,
    ) -> Self {
        Self {
            events,
            store,
            subscriptions,
            audit,
            webhook_secret,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library's verifier first; falls back to manual signature
    /// verification for API versions the library does not recognize.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified event: claim it, process it, record the outcome.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .events
            .claim_event(&event_id, &event_type, event_timestamp)
            .await?;

        if !claimed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event - already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let result = self.process_event(&event).await;

        let (outcome, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .events
            .finish_event(&event_id, outcome, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing outcome"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CustomerSubscriptionCreated
            | EventType::CustomerSubscriptionUpdated
            | EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.reconcile_reference(&subscription).await
            }
            EventType::CheckoutSessionCompleted => {
                let session = extract_checkout_session(event)?;
                self.link_checkout(&session).await
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    /// Pull-reconcile the row referenced by a subscription event,
    /// creating a linked row first if the event carries a user id for a
    /// subscription we have never seen.
    async fn reconcile_reference(&self, subscription: &Subscription) -> BillingResult<()> {
        let stripe_id = subscription.id.to_string();

        let local = match self.store.find_by_billing_ref(&stripe_id).await? {
            Some(local) => local,
            None => {
                let Some(user_id) = user_id_from_metadata(&subscription.metadata) else {
                    tracing::warn!(
                        stripe_subscription_id = %stripe_id,
                        "Subscription event has no local row and no user_id metadata - skipping"
                    );
                    return Ok(());
                };
                self.create_linked_row(user_id, subscription).await?
            }
        };

        self.subscriptions
            .sync_record(&local, Actor::system())
            .await?;
        Ok(())
    }

    /// Link a completed checkout to a local subscription row, then pull
    /// the authoritative state.
    async fn link_checkout(&self, session: &CheckoutSession) -> BillingResult<()> {
        let Some(stripe_id) = session
            .subscription
            .as_ref()
            .map(|s| match s {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(sub) => sub.id.to_string(),
            })
        else {
            tracing::info!("Checkout session completed without a subscription - nothing to link");
            return Ok(());
        };

        if let Some(local) = self.store.find_by_billing_ref(&stripe_id).await? {
            self.subscriptions
                .sync_record(&local, Actor::system())
                .await?;
            return Ok(());
        }

        let user_id = session
            .metadata
            .as_ref()
            .and_then(user_id_from_metadata)
            .or_else(|| {
                session
                    .client_reference_id
                    .as_deref()
                    .and_then(|s| s.parse().ok())
            })
            .ok_or_else(|| {
                BillingError::Validation(
                    "checkout session carries no user_id metadata or client reference".to_string(),
                )
            })?;

        let customer_id = session.customer.as_ref().map(|c| match c {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        });

        let now = OffsetDateTime::now_utc();
        let record = self
            .store
            .insert(NewSubscription {
                user_id,
                // placeholder until the sync below pulls real state;
                // a recent incomplete row still entitles via the grace window
                status: promptsouq_shared::SubscriptionStatus::Incomplete,
                plan: "pro".to_string(),
                billing_interval: promptsouq_shared::BillingInterval::Monthly,
                current_period_start: now,
                current_period_end: now,
                cancel_at_period_end: false,
                stripe_subscription_id: Some(stripe_id.clone()),
                stripe_customer_id: customer_id,
                stripe_price_id: None,
            })
            .await?;

        self.audit
            .append(
                AuditEntry::new("subscription.linked", "subscription", record.id).details(
                    serde_json::json!({
                        "user_id": user_id,
                        "stripe_subscription_id": stripe_id,
                        "source": "checkout.session.completed",
                    }),
                ),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.id,
            stripe_subscription_id = %stripe_id,
            "Linked checkout to new subscription row"
        );

        self.subscriptions
            .sync_record(&record, Actor::system())
            .await?;
        Ok(())
    }

    async fn create_linked_row(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<crate::store::SubscriptionRecord> {
        let stripe_id = subscription.id.to_string();
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        let now = OffsetDateTime::now_utc();
        let record = self
            .store
            .insert(NewSubscription {
                user_id,
                status: promptsouq_shared::SubscriptionStatus::Incomplete,
                plan: "pro".to_string(),
                billing_interval: promptsouq_shared::BillingInterval::Monthly,
                current_period_start: now,
                current_period_end: now,
                cancel_at_period_end: false,
                stripe_subscription_id: Some(stripe_id.clone()),
                stripe_customer_id: Some(customer_id),
                stripe_price_id: None,
            })
            .await?;

        self.audit
            .append(
                AuditEntry::new("subscription.linked", "subscription", record.id).details(
                    serde_json::json!({
                        "user_id": user_id,
                        "stripe_subscription_id": stripe_id,
                        "source": "subscription_event",
                    }),
                ),
            )
            .await?;

        Ok(record)
    }
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        other => Err(BillingError::Validation(format!(
            "expected subscription object in event, got {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

fn extract_checkout_session(event: &Event) -> BillingResult<CheckoutSession> {
    match &event.data.object {
        EventObject::CheckoutSession(session) => Ok(session.clone()),
        other => Err(BillingError::Validation(format!(
            "expected checkout session object in event, got {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

fn user_id_from_metadata(metadata: &std::collections::HashMap<String, String>) -> Option<Uuid> {
    metadata.get("user_id").and_then(|s| s.parse().ok())
}
