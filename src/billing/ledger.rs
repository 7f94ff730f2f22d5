use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{channel, error::TrySendError, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::StoreError;

use super::plans::FeatureType;
use super::store::{BillingStore, UsageEntry};

/// key: usage-period -> calendar month bucket (UTC), rendered `YYYY-MM`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn for_instant(now: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", now.year(), now.month()))
    }

    pub fn current() -> Self {
        Self::for_instant(Utc::now())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let first_of_month = NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d").ok()?;
        Some(Self(format!(
            "{:04}-{:02}",
            first_of_month.year(),
            first_of_month.month()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Half-open `[start, end)` bounds of the month.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = NaiveDate::parse_from_str(&format!("{}-01", self.0), "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?;
        let start = Utc.from_utc_datetime(&start);
        let end = start.checked_add_months(Months::new(1))?;
        Some((start, end))
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// key: usage-ledger -> append/aggregate feature consumption
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn BillingStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        quantity: u32,
        period: &PeriodKey,
    ) -> Result<(), StoreError> {
        if quantity == 0 {
            return Ok(());
        }
        let entry = UsageEntry {
            id: Uuid::new_v4(),
            user_id,
            feature,
            period_key: period.clone(),
            quantity: i64::from(quantity),
            recorded_at: Utc::now(),
        };
        self.store.append_usage(&entry).await
    }

    /// Sum of every entry for the triple; an untouched period reads as zero.
    pub async fn current_usage(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        period: &PeriodKey,
    ) -> Result<i64, StoreError> {
        self.store.sum_usage(user_id, feature, period).await
    }

    pub async fn usage_by_feature(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> Result<HashMap<FeatureType, i64>, StoreError> {
        self.store.usage_by_feature(user_id, period).await
    }
}

#[derive(Debug)]
struct UsageJob {
    user_id: Uuid,
    feature: FeatureType,
    quantity: u32,
    period: PeriodKey,
}

/// key: usage-recorder -> bounded fire-and-forget queue
///
/// `record` never awaits the store. Jobs that are accepted are written by the
/// worker once; failures are logged and not retried.
#[derive(Clone)]
pub struct UsageRecorder {
    sender: Sender<UsageJob>,
}

impl UsageRecorder {
    pub fn record(&self, user_id: Uuid, feature: FeatureType, quantity: u32) -> bool {
        self.record_in(user_id, feature, quantity, PeriodKey::current())
    }

    pub fn record_in(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        quantity: u32,
        period: PeriodKey,
    ) -> bool {
        let job = UsageJob {
            user_id,
            feature,
            quantity,
            period,
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    user_id = %job.user_id,
                    feature = %job.feature,
                    quantity = job.quantity,
                    "usage queue saturated; dropping usage record"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                error!(
                    user_id = %job.user_id,
                    feature = %job.feature,
                    "usage recorder worker has stopped; dropping usage record"
                );
                false
            }
        }
    }
}

/// Spawns the ledger writer. The returned handle completes once every
/// `UsageRecorder` clone has been dropped and the queue has drained.
pub fn start_usage_recorder(ledger: UsageLedger, capacity: usize) -> (UsageRecorder, JoinHandle<()>) {
    let (tx, mut rx) = channel::<UsageJob>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match ledger
                .record(job.user_id, job.feature, job.quantity, &job.period)
                .await
            {
                Ok(()) => debug!(
                    user_id = %job.user_id,
                    feature = %job.feature,
                    quantity = job.quantity,
                    period = %job.period,
                    "usage recorded"
                ),
                Err(err) => error!(
                    ?err,
                    user_id = %job.user_id,
                    feature = %job.feature,
                    quantity = job.quantity,
                    period = %job.period,
                    "failed to record usage"
                ),
            }
        }
    });
    (UsageRecorder { sender: tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::PeriodKey;
    use chrono::{TimeZone, Utc};

    #[test]
    fn period_key_is_calendar_month_utc() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(PeriodKey::for_instant(instant).as_str(), "2024-03");
        let next = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(PeriodKey::for_instant(next).as_str(), "2024-04");
    }

    #[test]
    fn period_key_parse_rejects_garbage() {
        assert_eq!(
            PeriodKey::parse("2024-07").map(|k| k.to_string()),
            Some("2024-07".into())
        );
        assert!(PeriodKey::parse("2024-13").is_none());
        assert!(PeriodKey::parse("march").is_none());
    }

    #[test]
    fn period_bounds_span_one_month() {
        let key = PeriodKey::parse("2024-12").unwrap();
        let (start, end) = key.bounds().unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
}
