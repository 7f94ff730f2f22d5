use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::StoreError;

use super::ledger::{PeriodKey, UsageLedger, UsageRecorder};
use super::models::PlanType;
use super::plans::{FeatureType, Limit, PlanLimitTable};
use super::subscriptions::SubscriptionService;

/// key: entitlement-decision -> result of a single access check
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AccessDecision {
    pub feature: FeatureType,
    pub plan: PlanType,
    pub allowed: bool,
    pub limit: Limit,
    pub current_usage: i64,
    pub remaining: Option<i64>,
    pub period_key: PeriodKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Paywall payload returned when a limit has been reached.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AccessDenial {
    pub feature: FeatureType,
    pub plan: PlanType,
    pub limit: Limit,
    pub current_usage: i64,
    pub upgrade_required: bool,
    pub suggested_plan: Option<PlanType>,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{} limit reached", .0.feature)]
    Denied(AccessDenial),
    #[error("entitlement check unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum GuardedActionError<E> {
    #[error("{} limit reached", .0.feature)]
    Denied(AccessDenial),
    #[error("entitlement check unavailable: {0}")]
    Unavailable(String),
    #[error("guarded action failed: {0}")]
    Action(E),
}

impl<E> From<AccessError> for GuardedActionError<E> {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied(denial) => GuardedActionError::Denied(denial),
            AccessError::Unavailable(reason) => GuardedActionError::Unavailable(reason),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FeatureUsage {
    pub feature: FeatureType,
    pub limit: Limit,
    pub used: i64,
    pub remaining: Option<i64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageSummary {
    pub user_id: Uuid,
    pub plan: PlanType,
    pub period_key: PeriodKey,
    /// When the period's counters start over.
    pub resets_at: Option<DateTime<Utc>>,
    pub features: Vec<FeatureUsage>,
}

/// key: entitlement-evaluator -> plan limits vs. ledger usage
#[derive(Clone)]
pub struct EntitlementEvaluator {
    subscriptions: SubscriptionService,
    ledger: UsageLedger,
    limits: Arc<PlanLimitTable>,
    recorder: UsageRecorder,
}

impl EntitlementEvaluator {
    pub fn new(
        subscriptions: SubscriptionService,
        ledger: UsageLedger,
        limits: Arc<PlanLimitTable>,
        recorder: UsageRecorder,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            limits,
            recorder,
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    pub async fn check_access(&self, user_id: Uuid, feature: FeatureType) -> AccessDecision {
        self.check_access_at(user_id, feature, Utc::now()).await
    }

    /// Never fails: a subscription read error evaluates as the free plan and a
    /// usage read error denies with `error` populated.
    pub async fn check_access_at(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let period_key = PeriodKey::for_instant(now);
        let plan = match self.subscriptions.effective_plan_at(user_id, now).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(?err, %user_id, "subscription lookup failed; evaluating as free plan");
                PlanType::Free
            }
        };

        let limit = self.limits.limit(plan, feature);
        if limit == Limit::Unlimited {
            return AccessDecision {
                feature,
                plan,
                allowed: true,
                limit,
                current_usage: 0,
                remaining: None,
                period_key,
                error: None,
            };
        }

        match self.ledger.current_usage(user_id, feature, &period_key).await {
            Ok(current_usage) => AccessDecision {
                feature,
                plan,
                allowed: limit.allows(current_usage),
                limit,
                current_usage,
                remaining: limit.remaining(current_usage),
                period_key,
                error: None,
            },
            Err(err) => {
                error!(?err, %user_id, %feature, "usage lookup failed; denying access");
                AccessDecision {
                    feature,
                    plan,
                    allowed: false,
                    limit,
                    current_usage: 0,
                    remaining: None,
                    period_key,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub async fn require_access(
        &self,
        user_id: Uuid,
        feature: FeatureType,
    ) -> Result<AccessDecision, AccessError> {
        self.require_access_at(user_id, feature, Utc::now()).await
    }

    pub async fn require_access_at(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, AccessError> {
        let decision = self.check_access_at(user_id, feature, now).await;
        if let Some(reason) = &decision.error {
            return Err(AccessError::Unavailable(reason.clone()));
        }
        if decision.allowed {
            return Ok(decision);
        }

        let suggested_plan =
            self.limits
                .upgrade_for(decision.plan, feature, decision.current_usage);
        info!(
            %user_id,
            %feature,
            plan = decision.plan.as_str(),
            current_usage = decision.current_usage,
            suggested_plan = ?suggested_plan.map(|plan| plan.as_str()),
            "feature access denied"
        );
        Err(AccessError::Denied(AccessDenial {
            feature,
            plan: decision.plan,
            limit: decision.limit,
            current_usage: decision.current_usage,
            upgrade_required: true,
            suggested_plan,
        }))
    }

    /// Runs `action` only when access is granted and records usage only once
    /// it has succeeded.
    pub async fn track_and_check<T, E, F, Fut>(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        quantity: u32,
        action: F,
    ) -> Result<T, GuardedActionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let decision = self.require_access(user_id, feature).await?;
        let value = action().await.map_err(GuardedActionError::Action)?;
        self.recorder
            .record_in(user_id, feature, quantity, decision.period_key);
        Ok(value)
    }

    /// Queues a usage record for the current period. Returns whether it was accepted.
    pub fn record(&self, user_id: Uuid, feature: FeatureType, quantity: u32) -> bool {
        self.recorder.record(user_id, feature, quantity)
    }

    pub async fn usage_summary(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary, StoreError> {
        self.usage_summary_for_period(user_id, PeriodKey::for_instant(now), now)
            .await
    }

    /// Usage for `period_key` measured against the plan in effect at `now`.
    pub async fn usage_summary_for_period(
        &self,
        user_id: Uuid,
        period_key: PeriodKey,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary, StoreError> {
        let plan = self.subscriptions.effective_plan_at(user_id, now).await?;
        let used = self.ledger.usage_by_feature(user_id, &period_key).await?;

        let features = FeatureType::ALL
            .into_iter()
            .map(|feature| {
                let limit = self.limits.limit(plan, feature);
                let used = used.get(&feature).copied().unwrap_or(0);
                FeatureUsage {
                    feature,
                    limit,
                    used,
                    remaining: limit.remaining(used),
                }
            })
            .collect();

        Ok(UsageSummary {
            user_id,
            plan,
            resets_at: period_key.bounds().map(|(_, end)| end),
            period_key,
            features,
        })
    }
}
