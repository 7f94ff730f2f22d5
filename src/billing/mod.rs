use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::StoreError;

pub mod api;
pub mod entitlements;
pub mod ledger;
pub mod models;
pub mod plans;
pub mod store;
pub mod subscriptions;
pub mod webhook;

pub use api::{
    check_access as billing_check_access, get_grace_period as billing_get_grace_period,
    get_scheduled_downgrade as billing_get_scheduled_downgrade,
    get_usage_summary as billing_get_usage_summary, receive_webhook as billing_receive_webhook,
    record_usage as billing_record_usage, require_access as billing_require_access,
};
pub use entitlements::{
    AccessDecision, AccessDenial, AccessError, EntitlementEvaluator, FeatureUsage,
    GuardedActionError, UsageSummary,
};
pub use ledger::{start_usage_recorder, PeriodKey, UsageLedger, UsageRecorder};
pub use models::{
    BillingEvent, BillingEventKind, GracePeriodInfo, GraceReason, PlanType,
    ScheduledDowngradeInfo, Subscription, SubscriptionStatus,
};
pub use plans::{FeatureType, Limit, PlanLimitTable, PlanTableError};
pub use store::{BillingStore, UsageEntry};
pub use subscriptions::{effective_plan, grace_period, GracePolicy, SubscriptionService};

/// key: billing-errors -> subscription event handling failures
#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unrecognised subscription status `{0}`")]
    UnknownStatus(String),
    #[error("illegal subscription transition {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("no subscription matches external id `{0}`")]
    UnmatchedEvent(String),
    #[error("billing event for `{0}` is missing `{1}`")]
    MissingField(String, &'static str),
    #[error("event for `{external_id}` at {occurred_at} predates last applied event at {last_event_at}")]
    StaleEvent {
        external_id: String,
        occurred_at: DateTime<Utc>,
        last_event_at: DateTime<Utc>,
    },
    #[error("subscription `{0}` has been replaced by a newer one")]
    SupersededSubscription(String),
    #[error("subscription for `{0}` kept changing while the event was applied")]
    ConcurrentUpdate(String),
}
