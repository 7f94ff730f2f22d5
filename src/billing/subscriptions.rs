use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::StoreError;

use super::models::{
    BillingEvent, BillingEventKind, GracePeriodInfo, GraceReason, PlanType,
    ScheduledDowngradeInfo, Subscription, SubscriptionStatus,
};
use super::store::BillingStore;
use super::BillingError;

/// key: billing-grace-policy -> past_due window length
#[derive(Clone, Copy, Debug)]
pub struct GracePolicy {
    pub past_due_window: Duration,
}

impl GracePolicy {
    pub fn days(days: i64) -> Self {
        Self {
            past_due_window: Duration::days(days.max(0)),
        }
    }
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self::days(7)
    }
}

/// Plan the user is entitled to at `now`. Grace expiry and period-end
/// cancellation are evaluated here rather than waiting for a webhook.
pub fn effective_plan(
    subscription: Option<&Subscription>,
    now: DateTime<Utc>,
    policy: &GracePolicy,
) -> PlanType {
    let Some(subscription) = subscription else {
        return PlanType::Free;
    };
    match subscription.status {
        SubscriptionStatus::Canceled => PlanType::Free,
        SubscriptionStatus::PastDue => {
            if now < past_due_deadline(subscription, policy) {
                plan_at(subscription, now)
            } else {
                PlanType::Free
            }
        }
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
            if subscription.cancel_at_period_end && now >= subscription.current_period_end {
                PlanType::Free
            } else {
                plan_at(subscription, now)
            }
        }
    }
}

pub fn grace_period(
    subscription: Option<&Subscription>,
    now: DateTime<Utc>,
    policy: &GracePolicy,
) -> GracePeriodInfo {
    let window = subscription.and_then(|subscription| match subscription.status {
        SubscriptionStatus::PastDue => Some((
            past_due_deadline(subscription, policy),
            GraceReason::PaymentFailed,
        )),
        SubscriptionStatus::Active | SubscriptionStatus::Trialing
            if subscription.cancel_at_period_end =>
        {
            Some((subscription.current_period_end, GraceReason::CancelScheduled))
        }
        _ => None,
    });

    match (subscription, window) {
        (Some(subscription), Some((end, reason))) => {
            let in_grace_period = now < end;
            GracePeriodInfo {
                in_grace_period,
                days_remaining: if in_grace_period { ceil_days(end - now) } else { 0 },
                tier: if in_grace_period {
                    plan_at(subscription, now)
                } else {
                    PlanType::Free
                },
                end_date: Some(end),
                reason: Some(reason),
            }
        }
        _ => GracePeriodInfo {
            in_grace_period: false,
            days_remaining: 0,
            tier: effective_plan(subscription, now, policy),
            end_date: None,
            reason: None,
        },
    }
}

fn plan_at(subscription: &Subscription, now: DateTime<Utc>) -> PlanType {
    match subscription.scheduled_plan_type {
        Some(scheduled) if now >= subscription.current_period_end => scheduled,
        _ => subscription.plan_type,
    }
}

fn past_due_deadline(subscription: &Subscription, policy: &GracePolicy) -> DateTime<Utc> {
    subscription
        .past_due_since
        .unwrap_or(subscription.updated_at)
        + policy.past_due_window
}

fn ceil_days(remaining: Duration) -> i64 {
    let seconds = remaining.num_seconds().max(0);
    (seconds + 86_399) / 86_400
}

/// Folds a billing event into the stored row. Pure so replays can be reasoned
/// about: applying the same event twice yields the same row apart from
/// `updated_at`, and an event older than `last_event_at` is refused.
pub fn apply_transition(
    existing: Option<&Subscription>,
    event: &BillingEvent,
    now: DateTime<Utc>,
) -> Result<Subscription, BillingError> {
    let next_status = match event.kind {
        BillingEventKind::SubscriptionDeleted => SubscriptionStatus::Canceled,
        BillingEventKind::PaymentFailed => SubscriptionStatus::PastDue,
        BillingEventKind::PaymentSucceeded => SubscriptionStatus::Active,
        BillingEventKind::SubscriptionCreated | BillingEventKind::SubscriptionUpdated => {
            SubscriptionStatus::from_external(&event.status)
                .ok_or_else(|| BillingError::UnknownStatus(event.status.clone()))?
        }
    };

    let Some(current) = existing else {
        if !matches!(
            event.kind,
            BillingEventKind::SubscriptionCreated | BillingEventKind::SubscriptionUpdated
        ) {
            return Err(BillingError::UnmatchedEvent(
                event.external_subscription_id.clone(),
            ));
        }
        let user_id = event.user_id.ok_or_else(|| {
            BillingError::MissingField(event.external_subscription_id.clone(), "user_id")
        })?;
        let current_period_start = event.current_period_start.ok_or_else(|| {
            BillingError::MissingField(
                event.external_subscription_id.clone(),
                "current_period_start",
            )
        })?;
        let current_period_end = event.current_period_end.ok_or_else(|| {
            BillingError::MissingField(event.external_subscription_id.clone(), "current_period_end")
        })?;
        return Ok(Subscription {
            user_id,
            plan_type: event.plan_type.unwrap_or(PlanType::Free),
            scheduled_plan_type: None,
            status: next_status,
            current_period_start,
            current_period_end,
            cancel_at_period_end: event.cancel_at_period_end.unwrap_or(false),
            external_billing_id: event.external_subscription_id.clone(),
            external_customer_id: event.customer_id.clone(),
            past_due_since: (next_status == SubscriptionStatus::PastDue)
                .then_some(event.occurred_at),
            last_event_at: Some(event.occurred_at),
            created_at: now,
            updated_at: now,
        });
    };

    if let Some(last_event_at) = current.last_event_at {
        if event.occurred_at < last_event_at {
            return Err(BillingError::StaleEvent {
                external_id: event.external_subscription_id.clone(),
                occurred_at: event.occurred_at,
                last_event_at,
            });
        }
    }

    // A newer created/updated event under another id means the user moved to a
    // new provider subscription; anything else for the old id is superseded.
    let replaces = current.external_billing_id != event.external_subscription_id;
    if replaces
        && !matches!(
            event.kind,
            BillingEventKind::SubscriptionCreated | BillingEventKind::SubscriptionUpdated
        )
    {
        return Err(BillingError::SupersededSubscription(
            event.external_subscription_id.clone(),
        ));
    }
    if !replaces && !current.status.can_transition_to(next_status) {
        return Err(BillingError::IllegalTransition {
            from: current.status.as_str(),
            to: next_status.as_str(),
        });
    }

    let mut next = current.clone();
    next.status = next_status;
    next.updated_at = now;
    next.last_event_at = Some(event.occurred_at);
    if let Some(customer_id) = &event.customer_id {
        next.external_customer_id = Some(customer_id.clone());
    }

    if replaces {
        next.external_billing_id = event.external_subscription_id.clone();
        next.plan_type = event.plan_type.unwrap_or(current.plan_type);
        next.scheduled_plan_type = None;
        next.cancel_at_period_end = false;
        next.past_due_since = None;
    }

    if let Some(period_start) = event.current_period_start {
        if period_start > current.current_period_start {
            if let Some(scheduled) = next.scheduled_plan_type.take() {
                next.plan_type = scheduled;
            }
        }
        next.current_period_start = period_start;
    }
    if let Some(period_end) = event.current_period_end {
        next.current_period_end = period_end;
    }
    if let Some(cancel_at_period_end) = event.cancel_at_period_end {
        next.cancel_at_period_end = cancel_at_period_end;
    }

    if let (Some(plan), false) = (event.plan_type, replaces) {
        if plan > next.plan_type {
            next.plan_type = plan;
            next.scheduled_plan_type = None;
        } else if plan < next.plan_type {
            next.scheduled_plan_type = Some(plan);
        } else {
            next.scheduled_plan_type = None;
        }
    }

    next.past_due_since = if next_status == SubscriptionStatus::PastDue {
        next.past_due_since.or(Some(event.occurred_at))
    } else {
        None
    };

    Ok(next)
}

const MAX_EVENT_WRITE_ATTEMPTS: u32 = 3;

/// key: subscription-state-machine -> webhook-driven transitions
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    policy: GracePolicy,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, policy: GracePolicy) -> Self {
        Self { store, policy }
    }

    /// Applies one billing event as a compare-and-set against the row it was
    /// derived from, re-reading when a concurrent webhook wrote first.
    pub async fn apply_billing_event(
        &self,
        event: &BillingEvent,
    ) -> Result<Subscription, BillingError> {
        for attempt in 1..=MAX_EVENT_WRITE_ATTEMPTS {
            let existing = self.matching_subscription(event).await?;
            let next = match apply_transition(existing.as_ref(), event, Utc::now()) {
                Ok(next) => next,
                Err(err) => {
                    warn!(
                        ?err,
                        event = event.kind.as_str(),
                        external_subscription_id = %event.external_subscription_id,
                        "billing event rejected"
                    );
                    return Err(err);
                }
            };

            let expected = existing.as_ref().map(|subscription| subscription.updated_at);
            let Some(stored) = self.store.save_subscription(&next, expected).await? else {
                warn!(
                    attempt,
                    user_id = %next.user_id,
                    external_subscription_id = %event.external_subscription_id,
                    "subscription changed concurrently; re-reading"
                );
                continue;
            };

            info!(
                user_id = %stored.user_id,
                event = event.kind.as_str(),
                status = stored.status.as_str(),
                plan = stored.plan_type.as_str(),
                scheduled_plan = ?stored.scheduled_plan_type.map(|plan| plan.as_str()),
                "subscription updated from billing event"
            );
            return Ok(stored);
        }
        Err(BillingError::ConcurrentUpdate(
            event.external_subscription_id.clone(),
        ))
    }

    async fn matching_subscription(
        &self,
        event: &BillingEvent,
    ) -> Result<Option<Subscription>, StoreError> {
        if let Some(subscription) = self
            .store
            .subscription_by_external_id(&event.external_subscription_id)
            .await?
        {
            return Ok(Some(subscription));
        }
        match event.user_id {
            Some(user_id) => self.store.subscription_for_user(user_id).await,
            None => Ok(None),
        }
    }

    pub async fn subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        self.store.subscription_for_user(user_id).await
    }

    pub async fn effective_plan_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PlanType, StoreError> {
        let subscription = self.store.subscription_for_user(user_id).await?;
        Ok(effective_plan(subscription.as_ref(), now, &self.policy))
    }

    pub async fn grace_period_info(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<GracePeriodInfo, StoreError> {
        let subscription = self.store.subscription_for_user(user_id).await?;
        Ok(grace_period(subscription.as_ref(), now, &self.policy))
    }

    pub async fn scheduled_downgrade_info(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledDowngradeInfo>, StoreError> {
        let subscription = self.store.subscription_for_user(user_id).await?;
        Ok(subscription.and_then(|subscription| {
            let scheduled = subscription.scheduled_plan_type?;
            (now < subscription.current_period_end).then_some(ScheduledDowngradeInfo {
                current_tier: subscription.plan_type,
                scheduled_tier: scheduled,
                effective_date: subscription.current_period_end,
            })
        }))
    }
}
