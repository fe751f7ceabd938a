//! Closed enumerations for the billing vocabulary.
//!
//! Status and interval values arrive as free-form strings from Stripe and
//! from historical database rows with inconsistent casing. Both are
//! normalized exactly once, here, at the parse boundary; everything
//! downstream works with the enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a known enum value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Subscription status, mirroring the external billing system's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    /// Statuses that count toward Pro entitlement.
    ///
    /// `past_due` is deliberately in this set: the observed system keeps
    /// past-due subscribers entitled until their period lapses.
    pub fn is_entitling(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::Incomplete
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            _ => Err(ParseEnumError {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cadence offered by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Quarterly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Quarterly => "quarterly",
            BillingInterval::Annual => "annual",
        }
    }
}

impl FromStr for BillingInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingInterval::Monthly),
            "quarterly" | "quarter" => Ok(BillingInterval::Quarterly),
            "annual" | "year" | "yearly" => Ok(BillingInterval::Annual),
            _ => Err(ParseEnumError {
                kind: "billing interval",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(
            "Active".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            "ACTIVE".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            "Past_Due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
    }

    #[test]
    fn status_accepts_british_cancelled() {
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn status_rejects_unknown_value() {
        let err = "definitely_not_a_status"
            .parse::<SubscriptionStatus>()
            .unwrap_err();
        assert_eq!(err.kind, "subscription status");
    }

    #[test]
    fn status_display_roundtrips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(status.to_string().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn entitling_statuses_match_observed_set() {
        assert!(SubscriptionStatus::Active.is_entitling());
        assert!(SubscriptionStatus::Trialing.is_entitling());
        assert!(SubscriptionStatus::PastDue.is_entitling());
        assert!(SubscriptionStatus::Incomplete.is_entitling());
        assert!(!SubscriptionStatus::Canceled.is_entitling());
        assert!(!SubscriptionStatus::Unpaid.is_entitling());
        assert!(!SubscriptionStatus::IncompleteExpired.is_entitling());
        assert!(!SubscriptionStatus::Paused.is_entitling());
    }

    #[test]
    fn interval_parses_stripe_vocabulary() {
        assert_eq!(
            "month".parse::<BillingInterval>().unwrap(),
            BillingInterval::Monthly
        );
        assert_eq!(
            "year".parse::<BillingInterval>().unwrap(),
            BillingInterval::Annual
        );
        assert_eq!(
            "Quarterly".parse::<BillingInterval>().unwrap(),
            BillingInterval::Quarterly
        );
    }
}
