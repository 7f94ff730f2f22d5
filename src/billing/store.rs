use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::StoreError;

use super::ledger::PeriodKey;
use super::models::Subscription;
use super::plans::FeatureType;

/// key: usage-ledger-entry -> append-only counter row
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub feature: FeatureType,
    pub period_key: PeriodKey,
    pub quantity: i64,
    pub recorded_at: DateTime<Utc>,
}

/// key: billing-store -> subscription rows and usage ledger
///
/// Implementations coordinate only through atomic store operations; callers
/// hold no in-process state between calls.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn subscription_for_user(&self, user_id: Uuid)
        -> Result<Option<Subscription>, StoreError>;

    async fn subscription_by_external_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Compare-and-set write keyed by `user_id`. `expected_updated_at` is the
    /// `updated_at` of the row the caller read, or `None` when it saw no row.
    /// Returns `None` when the stored row no longer matches.
    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn append_usage(&self, entry: &UsageEntry) -> Result<(), StoreError>;

    async fn sum_usage(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        period: &PeriodKey,
    ) -> Result<i64, StoreError>;

    async fn usage_by_feature(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> Result<HashMap<FeatureType, i64>, StoreError>;
}
