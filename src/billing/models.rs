use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: billing-models -> plans,subscriptions,events
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Premium,
    Business,
}

impl PlanType {
    pub const ALL: [PlanType; 3] = [PlanType::Free, PlanType::Premium, PlanType::Business];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Premium => "premium",
            PlanType::Business => "business",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "premium" => Some(Self::Premium),
            "business" => Some(Self::Business),
            _ => None,
        }
    }

    /// Collapses billing-cycle suffixed plan codes (`premium_monthly`,
    /// `business-annual`) onto the base plan. Anything unrecognised is free.
    pub fn normalize(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.starts_with("business") {
            PlanType::Business
        } else if normalized.starts_with("premium") {
            PlanType::Premium
        } else {
            PlanType::Free
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            PlanType::Free => 0,
            PlanType::Premium => 1,
            PlanType::Business => 2,
        }
    }

    /// The next plan up, if any.
    pub fn next_tier(&self) -> Option<Self> {
        match self {
            PlanType::Free => Some(PlanType::Premium),
            PlanType::Premium => Some(PlanType::Business),
            PlanType::Business => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Maps the billing provider's status vocabulary onto ours.
    pub fn from_external(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" | "unpaid" | "incomplete" => Some(Self::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Legal lifecycle edges. Re-applying the current status is always legal so
    /// replayed events converge.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Trialing, Active)
                | (Trialing, PastDue)
                | (Active, PastDue)
                | (PastDue, Active)
                | (Trialing, Canceled)
                | (Active, Canceled)
                | (PastDue, Canceled)
        )
    }
}

/// key: billing-subscription-model -> one row per user
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub scheduled_plan_type: Option<PlanType>,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub external_billing_id: String,
    pub external_customer_id: Option<String>,
    /// Set when the subscription enters `past_due`; the grace window runs from here.
    pub past_due_since: Option<DateTime<Utc>>,
    /// `occurred_at` of the newest billing event folded into this row.
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentFailed,
    PaymentSucceeded,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventKind::SubscriptionCreated => "subscription_created",
            BillingEventKind::SubscriptionUpdated => "subscription_updated",
            BillingEventKind::SubscriptionDeleted => "subscription_deleted",
            BillingEventKind::PaymentFailed => "payment_failed",
            BillingEventKind::PaymentSucceeded => "payment_succeeded",
        }
    }
}

/// key: billing-event -> normalized webhook payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingEvent {
    pub kind: BillingEventKind,
    pub external_subscription_id: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub plan_type: Option<PlanType>,
    #[serde(default)]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraceReason {
    PaymentFailed,
    CancelScheduled,
}

/// key: billing-grace -> read-time computed exposure
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GracePeriodInfo {
    pub in_grace_period: bool,
    pub days_remaining: i64,
    /// Plan the user keeps while the grace window is open.
    pub tier: PlanType,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<GraceReason>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ScheduledDowngradeInfo {
    pub current_tier: PlanType,
    pub scheduled_tier: PlanType,
    pub effective_date: DateTime<Utc>,
}
