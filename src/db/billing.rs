use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::billing::{
    BillingStore, FeatureType, PeriodKey, PlanType, Subscription, SubscriptionStatus, UsageEntry,
};

use super::{corrupt, StoreError};

const SUBSCRIPTION_COLUMNS: &str = r#"
    user_id,
    plan_type,
    scheduled_plan_type,
    status,
    current_period_start,
    current_period_end,
    cancel_at_period_end,
    external_billing_id,
    external_customer_id,
    past_due_since,
    last_event_at,
    created_at,
    updated_at
"#;

/// key: billing-db -> subscriptions + usage ledger on Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn plan_from_column(raw: &str) -> Result<PlanType, StoreError> {
    PlanType::from_str(raw)
        .ok_or_else(|| corrupt("subscriptions", format!("unknown plan_type `{raw}`")))
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let plan_type: String = row.try_get("plan_type")?;
    let scheduled_plan_type: Option<String> = row.try_get("scheduled_plan_type")?;
    let status: String = row.try_get("status")?;
    Ok(Subscription {
        user_id: row.try_get("user_id")?,
        plan_type: plan_from_column(&plan_type)?,
        scheduled_plan_type: scheduled_plan_type
            .as_deref()
            .map(plan_from_column)
            .transpose()?,
        status: SubscriptionStatus::from_str(&status)
            .ok_or_else(|| corrupt("subscriptions", format!("unknown status `{status}`")))?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        external_billing_id: row.try_get("external_billing_id")?,
        external_customer_id: row.try_get("external_customer_id")?,
        past_due_since: row.try_get("past_due_since")?,
        last_event_at: row.try_get("last_event_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn subscription_by_external_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_billing_id = $1"
        ))
        .bind(external_billing_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Subscription>, StoreError> {
        let Some(expected_updated_at) = expected_updated_at else {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (user_id) DO NOTHING
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ))
            .bind(subscription.user_id)
            .bind(subscription.plan_type.as_str())
            .bind(subscription.scheduled_plan_type.map(|plan| plan.as_str()))
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .bind(&subscription.external_billing_id)
            .bind(subscription.external_customer_id.as_deref())
            .bind(subscription.past_due_since)
            .bind(subscription.last_event_at)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .fetch_optional(&self.pool)
            .await?;
            return row.as_ref().map(subscription_from_row).transpose();
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions
            SET plan_type = $2,
                scheduled_plan_type = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                external_billing_id = $8,
                external_customer_id = $9,
                past_due_since = $10,
                last_event_at = $11,
                updated_at = $12
            WHERE user_id = $1 AND updated_at = $13
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.user_id)
        .bind(subscription.plan_type.as_str())
        .bind(subscription.scheduled_plan_type.map(|plan| plan.as_str()))
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(&subscription.external_billing_id)
        .bind(subscription.external_customer_id.as_deref())
        .bind(subscription.past_due_since)
        .bind(subscription.last_event_at)
        .bind(subscription.updated_at)
        .bind(expected_updated_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn append_usage(&self, entry: &UsageEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_ledger_entries (id, user_id, feature, period_key, quantity, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.feature.as_str())
        .bind(entry.period_key.as_str())
        .bind(entry.quantity)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sum_usage(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        period: &PeriodKey,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT AS total
            FROM usage_ledger_entries
            WHERE user_id = $1 AND feature = $2 AND period_key = $3
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(period.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    async fn usage_by_feature(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> Result<HashMap<FeatureType, i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT feature, COALESCE(SUM(quantity), 0)::BIGINT AS total
            FROM usage_ledger_entries
            WHERE user_id = $1 AND period_key = $2
            GROUP BY feature
            "#,
        )
        .bind(user_id)
        .bind(period.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut totals = HashMap::new();
        for row in rows {
            let feature: String = row.try_get("feature")?;
            let total: i64 = row.try_get("total")?;
            match FeatureType::from_str(&feature) {
                Some(feature) => {
                    totals.insert(feature, total);
                }
                None => warn!(%user_id, feature, "ignoring usage for unknown feature"),
            }
        }
        Ok(totals)
    }
}
