//! Entitlement Evaluator
//!
//! Decides whether a user currently has Pro access. `evaluate` is THE
//! function that answers this; it is pure, total, and side-effect free so
//! the decision table is exhaustively testable. The DB-reading wrapper
//! (`EntitlementService`) only gathers inputs.

use std::sync::Arc;

use promptsouq_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::settings::SettingsService;
use crate::store::{SubscriptionRecord, SubscriptionStore};

/// Just-started checkouts can sit in `incomplete` while the first payment
/// finalizes; within this window they still count as entitled.
pub const INCOMPLETE_GRACE_WINDOW: Duration = Duration::hours(24);

/// Why an entitlement decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementReason {
    /// The global override flag is on; everyone sees Pro content.
    GlobalOverride,
    /// No subscription row exists for the user.
    NoSubscription,
    /// Entitling status and the paid period has not ended.
    ActivePeriod,
    /// `incomplete` row created within the grace window.
    IncompleteGrace,
    /// Status is not in the entitling set (canceled, unpaid, ...).
    StatusNotEntitling,
    /// Status would entitle, but the paid period has lapsed.
    PeriodExpired,
}

/// Outcome of an entitlement check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitlementDecision {
    pub entitled: bool,
    pub reason: EntitlementReason,
}

impl EntitlementDecision {
    fn granted(reason: EntitlementReason) -> Self {
        Self {
            entitled: true,
            reason,
        }
    }

    fn denied(reason: EntitlementReason) -> Self {
        Self {
            entitled: false,
            reason,
        }
    }
}

/// Decide Pro access from a subscription row, the override flag, and the
/// current time. Total over its inputs: absence of data maps to a denial,
/// never to an error.
pub fn evaluate(
    sub: Option<&SubscriptionRecord>,
    show_pro_to_all: bool,
    now: OffsetDateTime,
) -> EntitlementDecision {
    // The override flag takes absolute precedence, including over "no row".
    if show_pro_to_all {
        return EntitlementDecision::granted(EntitlementReason::GlobalOverride);
    }

    let Some(sub) = sub else {
        return EntitlementDecision::denied(EntitlementReason::NoSubscription);
    };

    if !sub.status.is_entitling() {
        return EntitlementDecision::denied(EntitlementReason::StatusNotEntitling);
    }

    let period_valid = sub.current_period_end > now;
    let recent_incomplete = sub.status == SubscriptionStatus::Incomplete
        && now - sub.created_at < INCOMPLETE_GRACE_WINDOW;

    if period_valid {
        EntitlementDecision::granted(EntitlementReason::ActivePeriod)
    } else if recent_incomplete {
        EntitlementDecision::granted(EntitlementReason::IncompleteGrace)
    } else {
        EntitlementDecision::denied(EntitlementReason::PeriodExpired)
    }
}

/// Gathers evaluator inputs: override flag (read through on every call)
/// and the user's subscription of record.
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn SubscriptionStore>,
    settings: SettingsService,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn SubscriptionStore>, settings: SettingsService) -> Self {
        Self { store, settings }
    }

    pub async fn check(&self, user_id: Uuid) -> BillingResult<EntitlementDecision> {
        let show_pro_to_all = self.settings.show_pro_to_all().await?;
        let sub = self.store.find_latest_for_user(user_id).await?;
        Ok(evaluate(sub.as_ref(), show_pro_to_all, OffsetDateTime::now_utc()))
    }
}
