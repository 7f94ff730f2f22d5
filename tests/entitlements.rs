use std::sync::Arc;

use chrono::{Duration, Utc};
use metering_backend::billing::{
    start_usage_recorder, AccessError, BillingStore, EntitlementEvaluator, FeatureType,
    GracePolicy, GuardedActionError, Limit, PeriodKey, PlanLimitTable, PlanType, Subscription,
    SubscriptionService, SubscriptionStatus, UsageLedger,
};
use metering_backend::memory::MemoryBillingStore;
use tokio::task::JoinHandle;
use uuid::Uuid;

// key: entitlement-tests -> plan limits vs. ledger, outages, guarded actions

fn evaluator(store: Arc<MemoryBillingStore>) -> (EntitlementEvaluator, JoinHandle<()>) {
    let ledger = UsageLedger::new(store.clone());
    let (recorder, writer) = start_usage_recorder(ledger.clone(), 64);
    let subscriptions = SubscriptionService::new(store, GracePolicy::default());
    let evaluator = EntitlementEvaluator::new(
        subscriptions,
        ledger,
        Arc::new(PlanLimitTable::defaults()),
        recorder,
    );
    (evaluator, writer)
}

fn active_subscription(user_id: Uuid, plan: PlanType) -> Subscription {
    let now = Utc::now();
    Subscription {
        user_id,
        plan_type: plan,
        scheduled_plan_type: None,
        status: SubscriptionStatus::Active,
        current_period_start: now - Duration::days(3),
        current_period_end: now + Duration::days(27),
        cancel_at_period_end: false,
        external_billing_id: format!("sub_{user_id}"),
        external_customer_id: None,
        past_due_since: None,
        last_event_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn free_user_is_denied_once_chat_limit_is_used() {
    let store = Arc::new(MemoryBillingStore::new());
    let (evaluator, _writer) = evaluator(store.clone());
    let user_id = Uuid::new_v4();
    let now = Utc::now();
    let period = PeriodKey::for_instant(now);
    let ledger = UsageLedger::new(store.clone());

    ledger
        .record(user_id, FeatureType::ChatMessages, 19, &period)
        .await
        .unwrap();
    let decision = evaluator
        .check_access_at(user_id, FeatureType::ChatMessages, now)
        .await;
    assert!(decision.allowed);
    assert_eq!(decision.plan, PlanType::Free);
    assert_eq!(decision.remaining, Some(1));

    ledger
        .record(user_id, FeatureType::ChatMessages, 1, &period)
        .await
        .unwrap();
    let decision = evaluator
        .check_access_at(user_id, FeatureType::ChatMessages, now)
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.limit, Limit::Limited(20));
    assert_eq!(decision.current_usage, 20);
    assert_eq!(decision.remaining, Some(0));
    assert!(decision.error.is_none());

    match evaluator
        .require_access_at(user_id, FeatureType::ChatMessages, now)
        .await
    {
        Err(AccessError::Denied(denial)) => {
            assert!(denial.upgrade_required);
            assert_eq!(denial.suggested_plan, Some(PlanType::Premium));
            assert_eq!(denial.current_usage, 20);
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn unlimited_feature_skips_the_ledger() {
    let store = Arc::new(MemoryBillingStore::new());
    let user_id = Uuid::new_v4();
    store
        .save_subscription(&active_subscription(user_id, PlanType::Business), None)
        .await
        .unwrap();
    let (evaluator, _writer) = evaluator(store);

    let decision = evaluator
        .check_access(user_id, FeatureType::DocumentCreation)
        .await;
    assert!(decision.allowed);
    assert_eq!(decision.plan, PlanType::Business);
    assert_eq!(decision.current_usage, 0);
    assert_eq!(decision.limit, Limit::Unlimited);
    assert_eq!(decision.remaining, None);
}

#[tokio::test]
async fn store_outage_denies_with_error() {
    let store = Arc::new(MemoryBillingStore::new());
    let (evaluator, _writer) = evaluator(store.clone());
    store.set_unavailable(true);

    let decision = evaluator
        .check_access(Uuid::new_v4(), FeatureType::WeatherLookups)
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.plan, PlanType::Free);
    assert!(decision.error.is_some());

    let outcome = evaluator
        .require_access(Uuid::new_v4(), FeatureType::WeatherLookups)
        .await;
    assert!(matches!(outcome, Err(AccessError::Unavailable(_))));
}

#[tokio::test]
async fn concurrent_recording_is_never_lost() {
    let store = Arc::new(MemoryBillingStore::new());
    let ledger = UsageLedger::new(store.clone());
    let user_id = Uuid::new_v4();
    let period = PeriodKey::current();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let ledger = ledger.clone();
            let period = period.clone();
            tokio::spawn(async move {
                ledger
                    .record(user_id, FeatureType::WebSearches, 1, &period)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let total = ledger
        .current_usage(user_id, FeatureType::WebSearches, &period)
        .await
        .unwrap();
    assert_eq!(total, 50);
}

#[tokio::test]
async fn guarded_action_records_only_on_success() {
    let store = Arc::new(MemoryBillingStore::new());
    let (evaluator, writer) = evaluator(store.clone());
    let user_id = Uuid::new_v4();

    let failed: Result<(), GuardedActionError<&str>> = evaluator
        .track_and_check(user_id, FeatureType::DocumentCreation, 1, || async {
            Err("renderer crashed")
        })
        .await;
    assert!(matches!(failed, Err(GuardedActionError::Action("renderer crashed"))));

    let value = evaluator
        .track_and_check(user_id, FeatureType::DocumentCreation, 2, || async {
            Ok::<_, &str>("report.pdf")
        })
        .await
        .unwrap();
    assert_eq!(value, "report.pdf");

    // The writer drains and stops once the last recorder handle is gone.
    drop(evaluator);
    writer.await.unwrap();

    let total = store
        .sum_usage(user_id, FeatureType::DocumentCreation, &PeriodKey::current())
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(store.entry_count(), 1);
}

#[tokio::test]
async fn usage_summary_covers_every_feature() {
    let store = Arc::new(MemoryBillingStore::new());
    let user_id = Uuid::new_v4();
    store
        .save_subscription(&active_subscription(user_id, PlanType::Premium), None)
        .await
        .unwrap();
    let now = Utc::now();
    UsageLedger::new(store.clone())
        .record(user_id, FeatureType::ChatMessages, 7, &PeriodKey::for_instant(now))
        .await
        .unwrap();
    let (evaluator, _writer) = evaluator(store);

    let summary = evaluator.usage_summary(user_id, now).await.unwrap();
    assert_eq!(summary.plan, PlanType::Premium);
    assert_eq!(summary.features.len(), FeatureType::ALL.len());
    let chat = summary
        .features
        .iter()
        .find(|usage| usage.feature == FeatureType::ChatMessages)
        .unwrap();
    assert_eq!(chat.used, 7);
    assert_eq!(chat.remaining, Some(993));
}
