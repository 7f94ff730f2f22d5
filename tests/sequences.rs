use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metering_backend::billing::{
    start_usage_recorder, EntitlementEvaluator, GracePolicy, PlanLimitTable, SubscriptionService,
    UsageLedger,
};
use metering_backend::config::SchedulerSettings;
use metering_backend::memory::{MemoryBillingStore, MemorySequenceStore};
use metering_backend::messaging::{DispatchError, DispatchReceipt, MessagingProvider};
use metering_backend::sequences::scheduler::SEQUENCE_DEACTIVATED;
use metering_backend::sequences::{
    CallbackOutcome, Channel, Contact, DeliveryCorrelator, DeliveryRecord, DeliveryStatus,
    Enrollment, EnrollmentError, EnrollmentService, EnrollmentStatus, RenderedMessage,
    SchedulerError, SchedulerReport, Sequence, SequenceScheduler, SequenceStep, SequenceStore,
    StepDetail, StepOutcome, StepStatus,
};
use serde_json::json;
use uuid::Uuid;

// key: sequence-tests -> scheduler passes, claims, pauses, delivery callbacks

#[derive(Default)]
struct RecordingMessenger {
    sent: Mutex<Vec<(Channel, String, RenderedMessage)>>,
    counter: AtomicUsize,
    failing: AtomicBool,
    delay_ms: u64,
}

impl RecordingMessenger {
    fn slow(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(Channel, String, RenderedMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingProvider for RecordingMessenger {
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DispatchReceipt, DispatchError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Rejected {
                status: 400,
                message: "invalid destination".into(),
            });
        }
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((channel, destination.to_string(), message.clone()));
        Ok(DispatchReceipt {
            provider_message_id: format!("SM{id}"),
        })
    }
}

struct Harness {
    store: Arc<MemorySequenceStore>,
    messenger: Arc<RecordingMessenger>,
    scheduler: SequenceScheduler,
    enrollments: EnrollmentService,
    sequence_id: Uuid,
    contact_id: Uuid,
}

async fn harness(messenger: RecordingMessenger, settings: SchedulerSettings) -> Harness {
    let store = Arc::new(MemorySequenceStore::new());
    let messenger = Arc::new(messenger);
    let sequence_id = Uuid::new_v4();
    let owner_user_id = Uuid::new_v4();
    let step = |index: i32, wait_days: i64, channel: Channel, template: &str| SequenceStep {
        sequence_id,
        step_index: index,
        wait_offset: Duration::days(wait_days),
        channel,
        template: template.to_string(),
        subject: (channel == Channel::Email).then(|| "Checking in".to_string()),
    };
    store
        .create_sequence(
            &Sequence {
                id: sequence_id,
                owner_user_id,
                name: "New lead follow-up".into(),
                active: true,
                stop_on_reply: true,
                stop_on_booking: true,
            },
            &[
                step(0, 0, Channel::Sms, "Hi {{first_name}}, welcome to {{agency}}!"),
                step(1, 1, Channel::Sms, "Still looking, {{first_name}}?"),
                step(2, 3, Channel::Email, "Hello {{name}}, here are new listings."),
            ],
        )
        .await
        .unwrap();

    let contact_id = Uuid::new_v4();
    store
        .upsert_contact(&Contact {
            id: contact_id,
            name: "Jordan Lee".into(),
            phone: Some("+15550001111".into()),
            email: Some("jordan@example.com".into()),
        })
        .await
        .unwrap();

    let scheduler = SequenceScheduler::new(store.clone(), messenger.clone(), settings);
    Harness {
        enrollments: EnrollmentService::new(store.clone()),
        store,
        messenger,
        scheduler,
        sequence_id,
        contact_id,
    }
}

impl Harness {
    async fn enroll(&self, now: DateTime<Utc>) -> Uuid {
        self.enrollments
            .enroll(
                self.contact_id,
                self.sequence_id,
                json!({ "agency": "Harbor Realty" }),
                now,
            )
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn three_step_sequence_runs_to_completion() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;

    let report = h.scheduler.run_pass(t0).await.unwrap();
    assert_eq!(
        report,
        SchedulerReport {
            processed: 1,
            sent: 1,
            details: vec![StepDetail {
                enrollment_id,
                step_index: 0,
                outcome: StepOutcome::Sent,
                reason: None,
            }],
            ..SchedulerReport::default()
        }
    );
    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment_id).await.unwrap();
    assert_eq!(enrollment.current_step_index, 1);
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Active);
    assert_eq!(steps[0].status, StepStatus::Sent);
    assert_eq!(steps[0].provider_message_id.as_deref(), Some("SM0"));
    let record = h.store.delivery_record("SM0").await.unwrap().unwrap();
    assert_eq!(record.delivery_status, DeliveryStatus::Queued);
    assert_eq!(record.enrollment_step_id, Some(steps[0].id));

    // Second step waits a day from the first dispatch.
    let idle = h.scheduler.run_pass(t0 + Duration::hours(1)).await.unwrap();
    assert_eq!(idle, SchedulerReport::default());

    let t1 = t0 + Duration::days(1) + Duration::seconds(1);
    assert_eq!(h.scheduler.run_pass(t1).await.unwrap().sent, 1);

    let t2 = t1 + Duration::days(3) + Duration::seconds(1);
    let report = h.scheduler.run_pass(t2).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.completed, 1);
    let outcomes: Vec<_> = report.details.iter().map(|detail| detail.outcome).collect();
    assert_eq!(outcomes, [StepOutcome::Sent, StepOutcome::Completed]);

    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment_id).await.unwrap();
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Completed);
    assert!(steps.iter().all(|step| step.status == StepStatus::Sent));

    let sent = h.messenger.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].1, "+15550001111");
    assert_eq!(sent[0].2.body, "Hi Jordan, welcome to Harbor Realty!");
    assert_eq!(sent[2].0, Channel::Email);
    assert_eq!(sent[2].1, "jordan@example.com");
    assert_eq!(sent[2].2.subject.as_deref(), Some("Checking in"));

    assert_eq!(
        h.scheduler.run_pass(t2 + Duration::days(30)).await.unwrap(),
        SchedulerReport::default()
    );
}

#[tokio::test]
async fn dispatch_failure_pauses_until_resumed() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    h.messenger.failing.store(true, Ordering::SeqCst);
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;

    let report = h.scheduler.run_pass(t0).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(report.errors, 1);
    assert_eq!(report.paused, 1);

    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment_id).await.unwrap();
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Paused);
    assert!(enrollment
        .stop_reason
        .as_deref()
        .unwrap()
        .starts_with("step 0 failed"));
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].last_error.is_some());

    // Paused enrollments are left alone.
    assert_eq!(
        h.scheduler.run_pass(t0 + Duration::days(2)).await.unwrap(),
        SchedulerReport::default()
    );

    h.messenger.failing.store(false, Ordering::SeqCst);
    let resumed_at = t0 + Duration::days(2);
    let resumed = h
        .enrollments
        .resume_enrollment(enrollment_id, resumed_at)
        .await
        .unwrap();
    assert_eq!(resumed.enrollment_status, EnrollmentStatus::Active);
    assert_eq!(resumed.current_step_index, 1);
    assert_eq!(resumed.stop_reason, None);

    let report = h
        .scheduler
        .run_pass(resumed_at + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(h.messenger.sent()[0].2.body, "Still looking, Jordan?");
}

#[tokio::test]
async fn overlapping_passes_dispatch_once() {
    let h = harness(RecordingMessenger::slow(50), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    h.enroll(t0).await;

    let (first, second) = tokio::join!(h.scheduler.run_pass(t0), h.scheduler.run_pass(t0));
    let mut total = first.unwrap();
    total.merge(second.unwrap());

    assert_eq!(total.sent, 1);
    assert_eq!(total.processed, 1);
    assert_eq!(total.errors, 0);
    assert_eq!(h.messenger.sent().len(), 1);
}

#[tokio::test]
async fn abandoned_claim_is_reclaimed_after_ttl() {
    let settings = SchedulerSettings {
        claim_ttl_secs: 600,
        ..SchedulerSettings::default()
    };
    let h = harness(RecordingMessenger::default(), settings).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    let steps = h.store.enrollment_steps(enrollment_id).await.unwrap();

    // A pass that crashed after claiming.
    assert!(h
        .store
        .claim_step(steps[0].id, Uuid::new_v4(), t0, t0 - Duration::seconds(600))
        .await
        .unwrap());

    let fresh = h.scheduler.run_pass(t0 + Duration::seconds(60)).await.unwrap();
    assert_eq!(fresh, SchedulerReport::default());

    let stale = h
        .scheduler
        .run_pass(t0 + Duration::seconds(601))
        .await
        .unwrap();
    assert_eq!(stale.sent, 1);
    assert_eq!(h.messenger.sent().len(), 1);
}

#[tokio::test]
async fn deactivated_sequence_pauses_enrollments() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    assert!(h.store.set_sequence_active(h.sequence_id, false).await.unwrap());

    let report = h.scheduler.run_pass(t0).await.unwrap();
    assert_eq!(report.paused, 1);
    assert_eq!(report.sent, 0);

    let enrollment = h.store.enrollment(enrollment_id).await.unwrap().unwrap();
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Paused);
    assert_eq!(enrollment.stop_reason.as_deref(), Some(SEQUENCE_DEACTIVATED));
    assert!(h.messenger.sent().is_empty());

    let err = h
        .enrollments
        .resume_enrollment(enrollment_id, t0)
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollmentError::SequenceInactive(_)));
}

#[tokio::test]
async fn plan_limit_skips_step_without_sending() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let billing = Arc::new(MemoryBillingStore::new());
    let ledger = UsageLedger::new(billing.clone());
    let (recorder, _writer) = start_usage_recorder(ledger.clone(), 16);
    let evaluator = EntitlementEvaluator::new(
        SubscriptionService::new(billing, GracePolicy::default()),
        ledger,
        Arc::new(PlanLimitTable::defaults()),
        recorder,
    );
    // The owner has no subscription, and the free plan carries no SMS allowance.
    let scheduler = SequenceScheduler::new(
        h.store.clone(),
        h.messenger.clone(),
        SchedulerSettings::default(),
    )
    .with_entitlements(evaluator);

    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    let report = scheduler.run_pass(t0).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.sent, 0);

    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment_id).await.unwrap();
    assert_eq!(enrollment.current_step_index, 1);
    assert_eq!(steps[0].status, StepStatus::Skipped);
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn pass_honours_step_budget() {
    let settings = SchedulerSettings {
        max_steps_per_pass: 1,
        ..SchedulerSettings::default()
    };
    let h = harness(RecordingMessenger::default(), settings).await;
    let second_contact = Uuid::new_v4();
    h.store
        .upsert_contact(&Contact {
            id: second_contact,
            name: "Sam Ortiz".into(),
            phone: Some("+15550002222".into()),
            email: None,
        })
        .await
        .unwrap();
    let t0 = Utc::now();
    h.enroll(t0).await;
    h.enrollments
        .enroll(second_contact, h.sequence_id, json!({ "agency": "Harbor Realty" }), t0)
        .await
        .unwrap();

    assert_eq!(h.scheduler.run_pass(t0).await.unwrap().sent, 1);
    assert_eq!(h.scheduler.run_pass(t0).await.unwrap().sent, 1);
    assert_eq!(h.messenger.sent().len(), 2);
}

#[tokio::test]
async fn enrollment_is_unique_while_in_flight() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;

    let err = h
        .enrollments
        .enroll(h.contact_id, h.sequence_id, json!({}), t0)
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollmentError::AlreadyEnrolled));

    let stopped = h
        .enrollments
        .stop_enrollment(enrollment_id, Some("replied"), t0)
        .await
        .unwrap();
    assert_eq!(stopped.enrollment_status, EnrollmentStatus::Canceled);
    assert_eq!(stopped.stop_reason.as_deref(), Some("replied"));

    // Stopping twice is a no-op.
    let again = h
        .enrollments
        .stop_enrollment(enrollment_id, None, t0)
        .await
        .unwrap();
    assert_eq!(again.stop_reason.as_deref(), Some("replied"));

    assert!(h
        .enrollments
        .enroll(h.contact_id, h.sequence_id, json!({ "agency": "Harbor Realty" }), t0)
        .await
        .is_ok());
    assert_eq!(
        h.scheduler.run_pass(t0).await.unwrap().sent,
        1,
        "only the new enrollment is due"
    );
}

#[tokio::test]
async fn delivery_callbacks_are_idempotent_and_monotonic() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    h.enroll(t0).await;
    h.scheduler.run_pass(t0).await.unwrap();
    let correlator = DeliveryCorrelator::new(h.store.clone());

    let apply = |status: &'static str| {
        let correlator = correlator.clone();
        async move {
            correlator
                .on_delivery_callback("SM0", status, None, Some(&json!({ "To": "+15550001111" })), Utc::now())
                .await
                .unwrap()
        }
    };

    assert_eq!(apply("sent").await, CallbackOutcome::Applied);
    assert_eq!(apply("sent").await, CallbackOutcome::Duplicate);
    assert_eq!(apply("delivered").await, CallbackOutcome::Applied);
    assert_eq!(apply("sent").await, CallbackOutcome::Stale);
    assert_eq!(apply("mystery").await, CallbackOutcome::UnrecognizedStatus);

    let record = h.store.delivery_record("SM0").await.unwrap().unwrap();
    assert_eq!(record.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(record.metadata["To"], "+15550001111");
    assert_eq!(record.metadata["step_index"], 0);

    let unknown = correlator
        .on_delivery_callback("SM404", "delivered", None, None, Utc::now())
        .await
        .unwrap();
    assert_eq!(unknown, CallbackOutcome::UnknownMessage);
}

#[tokio::test]
async fn permanent_delivery_failure_marks_step_failed() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    h.scheduler.run_pass(t0).await.unwrap();
    let correlator = DeliveryCorrelator::new(h.store.clone());

    let outcome = correlator
        .on_delivery_callback("SM0", "undelivered", Some("30003"), None, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);

    let record = h.store.delivery_record("SM0").await.unwrap().unwrap();
    assert_eq!(record.delivery_status, DeliveryStatus::Undelivered);
    assert_eq!(record.error_code.as_deref(), Some("30003"));

    let steps = h.store.enrollment_steps(enrollment_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].last_error.as_deref().unwrap().contains("30003"));

    let replay = correlator
        .on_delivery_callback("SM0", "undelivered", Some("30003"), None, Utc::now())
        .await
        .unwrap();
    assert_eq!(replay, CallbackOutcome::Duplicate);
}

#[tokio::test]
async fn early_failure_callback_fails_step_still_being_sent() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    let steps = h.store.enrollment_steps(enrollment_id).await.unwrap();
    let token = Uuid::new_v4();
    assert!(h
        .store
        .claim_step(steps[0].id, token, t0, t0 - Duration::seconds(600))
        .await
        .unwrap());

    // The provider answered and reported the failure before the step was marked sent.
    h.store
        .insert_delivery_record(&DeliveryRecord {
            provider_message_id: "SM-early".into(),
            enrollment_step_id: Some(steps[0].id),
            claim_token: Some(token),
            channel: Channel::Sms,
            delivery_status: DeliveryStatus::Queued,
            error_code: None,
            metadata: json!({ "step_index": 0 }),
            created_at: t0,
            updated_at: t0,
        })
        .await
        .unwrap();
    let correlator = DeliveryCorrelator::new(h.store.clone());
    let outcome = correlator
        .on_delivery_callback("SM-early", "failed", Some("30007"), None, t0)
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);

    let steps = h.store.enrollment_steps(enrollment_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(!h
        .store
        .finish_step(steps[0].id, token, StepStatus::Sent, Some("SM-early"), None, t0)
        .await
        .unwrap());

    let report = h
        .scheduler
        .run_pass(t0 + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.paused, 1);
    let enrollment = h.store.enrollment(enrollment_id).await.unwrap().unwrap();
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Paused);
    assert!(enrollment
        .stop_reason
        .as_deref()
        .unwrap()
        .starts_with("step 0 failed"));
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn lost_claim_is_not_counted_or_advanced() {
    let h = harness(RecordingMessenger::slow(50), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;
    let step_id = h.store.enrollment_steps(enrollment_id).await.unwrap()[0].id;
    let rival = Uuid::new_v4();

    // Another pass takes the claim over while the first is still dispatching.
    let (report, reclaimed) = tokio::join!(h.scheduler.run_pass(t0), async {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.store
            .claim_step(step_id, rival, t0 + Duration::hours(1), t0 + Duration::seconds(1))
            .await
            .unwrap()
    });
    assert!(reclaimed);
    let report = report.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(report.errors, 0);
    assert!(report.details.is_empty());

    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment_id).await.unwrap();
    assert_eq!(enrollment.current_step_index, 0);
    assert_eq!(steps[0].status, StepStatus::Due);
    assert_eq!(steps[0].claim_token, Some(rival));
    assert_eq!(h.messenger.sent().len(), 1);
    assert!(h.store.delivery_record("SM0").await.unwrap().is_some());
}

#[tokio::test]
async fn render_failure_marks_step_failed_and_pauses() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    // No `agency` for the first template.
    let enrollment = h
        .enrollments
        .enroll(h.contact_id, h.sequence_id, json!({}), t0)
        .await
        .unwrap();

    let report = h.scheduler.run_pass(t0).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.paused, 1);
    assert_eq!(report.details[0].outcome, StepOutcome::Failed);
    assert!(report.details[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("agency"));

    let (enrollment, steps) = h.enrollments.enrollment_with_steps(enrollment.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].last_error.as_deref().unwrap().contains("agency"));
    assert_eq!(enrollment.enrollment_status, EnrollmentStatus::Paused);
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn unreadable_due_work_fails_the_pass() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    h.enroll(t0).await;
    h.store.set_unavailable(true);

    let err = h.scheduler.run_pass(t0).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DueWork(_)));
    assert!(h.messenger.sent().is_empty());

    h.store.set_unavailable(false);
    assert_eq!(h.scheduler.run_pass(t0).await.unwrap().sent, 1);
}

#[tokio::test]
async fn enrollment_without_remaining_steps_completes() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment = Enrollment {
        id: Uuid::new_v4(),
        contact_id: h.contact_id,
        sequence_id: h.sequence_id,
        enrolled_at: t0,
        current_step_index: 3,
        enrollment_status: EnrollmentStatus::Active,
        step_anchor_at: t0,
        stop_reason: None,
        metadata: json!({}),
        updated_at: t0,
    };
    assert!(h.store.insert_enrollment(&enrollment, &[]).await.unwrap());

    let report = h.scheduler.run_pass(t0).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(report.details.len(), 1);
    assert_eq!(report.details[0].outcome, StepOutcome::Completed);
    let stored = h.store.enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(stored.enrollment_status, EnrollmentStatus::Completed);
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn reply_stops_enrollments_that_stop_on_reply() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;

    let keeps_going = Uuid::new_v4();
    h.store
        .create_sequence(
            &Sequence {
                id: keeps_going,
                owner_user_id: Uuid::new_v4(),
                name: "Market updates".into(),
                active: true,
                stop_on_reply: false,
                stop_on_booking: false,
            },
            &[SequenceStep {
                sequence_id: keeps_going,
                step_index: 0,
                wait_offset: Duration::days(7),
                channel: Channel::Sms,
                template: "New listings this week, {{first_name}}.".into(),
                subject: None,
            }],
        )
        .await
        .unwrap();
    let other = h
        .enrollments
        .enroll(h.contact_id, keeps_going, json!({}), t0)
        .await
        .unwrap();

    let stopped = h
        .enrollments
        .stop_for_inbound_message("+15550001111", "Sounds good, call me", t0)
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, enrollment_id);
    assert_eq!(stopped[0].stop_reason.as_deref(), Some("customer_reply"));
    let other = h.store.enrollment(other.id).await.unwrap().unwrap();
    assert_eq!(other.enrollment_status, EnrollmentStatus::Active);

    // An opt-out ends everything.
    let stopped = h
        .enrollments
        .stop_for_inbound_message("+15550001111", " STOP ", t0)
        .await
        .unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, other.id);
    assert_eq!(stopped[0].stop_reason.as_deref(), Some("unsubscribed"));

    let unknown = h
        .enrollments
        .stop_for_inbound_message("+15559999999", "hello", t0)
        .await
        .unwrap();
    assert!(unknown.is_empty());
}

#[tokio::test]
async fn booking_stops_enrollments_that_stop_on_booking() {
    let h = harness(RecordingMessenger::default(), SchedulerSettings::default()).await;
    let t0 = Utc::now();
    let enrollment_id = h.enroll(t0).await;

    let stopped = h.enrollments.stop_for_booking(h.contact_id, t0).await.unwrap();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, enrollment_id);
    assert_eq!(stopped[0].enrollment_status, EnrollmentStatus::Canceled);
    assert_eq!(stopped[0].stop_reason.as_deref(), Some("appointment_booked"));
    assert_eq!(h.scheduler.run_pass(t0).await.unwrap(), SchedulerReport::default());

    let err = h
        .enrollments
        .stop_for_booking(Uuid::new_v4(), t0)
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollmentError::ContactNotFound(_)));
}
