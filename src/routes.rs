use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tokio::task::JoinHandle;

use crate::billing::{
    self, start_usage_recorder, BillingStore, EntitlementEvaluator, SubscriptionService,
    UsageLedger,
};
use crate::config::{BillingSettings, ConfigError, SchedulerSettings, UsageSettings};
use crate::messaging::MessagingProvider;
use crate::sequences::{
    self, DeliveryCorrelator, EnrollmentService, SequenceScheduler, SequenceStore,
};

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/entitlements/:user_id/check",
            post(billing::billing_check_access),
        )
        .route(
            "/api/entitlements/:user_id/require",
            post(billing::billing_require_access),
        )
        .route(
            "/api/usage/:user_id",
            get(billing::billing_get_usage_summary).post(billing::billing_record_usage),
        )
        .route(
            "/api/subscription/:user_id/grace-period",
            get(billing::billing_get_grace_period),
        )
        .route(
            "/api/subscription/:user_id/scheduled-downgrade",
            get(billing::billing_get_scheduled_downgrade),
        )
        .route("/api/billing/webhook", post(billing::billing_receive_webhook))
        .route(
            "/api/sequences/process",
            get(sequences::sequences_run_scheduler).post(sequences::sequences_run_scheduler),
        )
        .route(
            "/api/sequences/delivery-status",
            post(sequences::sequences_delivery_status_callback),
        )
        .route("/webhooks/twilio/sms", post(sequences::sequences_inbound_sms))
        .route(
            "/api/contacts/:contact_id/booked",
            post(sequences::sequences_contact_booked),
        )
        .route(
            "/api/sequences/:sequence_id/enrollments",
            post(sequences::sequences_enroll_contact),
        )
        .route(
            "/api/enrollments/:enrollment_id",
            get(sequences::sequences_get_enrollment),
        )
        .route(
            "/api/enrollments/:enrollment_id/stop",
            post(sequences::sequences_stop_enrollment),
        )
        .route(
            "/api/enrollments/:enrollment_id/resume",
            post(sequences::sequences_resume_enrollment),
        )
}

/// key: app-services -> handles shared by every request
#[derive(Clone)]
pub struct AppServices {
    pub evaluator: EntitlementEvaluator,
    pub scheduler: Arc<SequenceScheduler>,
    pub enrollments: EnrollmentService,
    pub correlator: DeliveryCorrelator,
    pub billing_settings: Arc<BillingSettings>,
}

impl AppServices {
    /// Wires the metering and sequencing services over the given stores and
    /// starts the usage writer. The returned handle finishes once every
    /// clone of the evaluator has been dropped.
    pub fn assemble(
        billing_store: Arc<dyn BillingStore>,
        sequence_store: Arc<dyn SequenceStore>,
        messenger: Arc<dyn MessagingProvider>,
        billing_settings: BillingSettings,
        scheduler_settings: SchedulerSettings,
        usage_settings: &UsageSettings,
    ) -> Result<(Self, JoinHandle<()>), ConfigError> {
        let limits = Arc::new(billing_settings.plan_limits()?);
        let ledger = UsageLedger::new(billing_store.clone());
        let (recorder, writer) = start_usage_recorder(ledger.clone(), usage_settings.queue_capacity);
        let subscriptions = SubscriptionService::new(billing_store, billing_settings.grace_policy());
        let evaluator = EntitlementEvaluator::new(subscriptions, ledger, limits, recorder);

        let scheduler = SequenceScheduler::new(sequence_store.clone(), messenger, scheduler_settings)
            .with_entitlements(evaluator.clone());

        Ok((
            Self {
                evaluator,
                scheduler: Arc::new(scheduler),
                enrollments: EnrollmentService::new(sequence_store.clone()),
                correlator: DeliveryCorrelator::new(sequence_store),
                billing_settings: Arc::new(billing_settings),
            },
            writer,
        ))
    }

    pub fn router(&self) -> Router {
        api_routes()
            .layer(Extension(self.evaluator.clone()))
            .layer(Extension(self.scheduler.clone()))
            .layer(Extension(self.enrollments.clone()))
            .layer(Extension(self.correlator.clone()))
            .layer(Extension(self.billing_settings.clone()))
    }
}
