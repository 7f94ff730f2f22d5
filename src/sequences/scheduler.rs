use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::billing::{AccessError, EntitlementEvaluator};
use crate::config::SchedulerSettings;
use crate::db::StoreError;
use crate::messaging::{DispatchError, MessagingProvider};

use super::models::{
    DeliveryRecord, DeliveryStatus, DueWork, EnrollmentStatus, SchedulerReport, StepOutcome,
    StepStatus,
};
use super::store::SequenceStore;
use super::template::render_step;

pub const SEQUENCE_DEACTIVATED: &str = "sequence deactivated";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to load due sequence steps: {0}")]
    DueWork(#[from] StoreError),
}

/// Shared state of one pass.
struct Pass {
    token: Uuid,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
    deadline: Instant,
    remaining_steps: AtomicUsize,
}

impl Pass {
    fn take_budget(&self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        self.remaining_steps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// key: sequence-scheduler -> claim, render, dispatch, advance
pub struct SequenceScheduler {
    store: Arc<dyn SequenceStore>,
    messenger: Arc<dyn MessagingProvider>,
    entitlements: Option<EntitlementEvaluator>,
    settings: SchedulerSettings,
}

impl SequenceScheduler {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        messenger: Arc<dyn MessagingProvider>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            messenger,
            entitlements: None,
            settings,
        }
    }

    /// Meters each dispatch against the sequence owner's plan.
    pub fn with_entitlements(mut self, evaluator: EntitlementEvaluator) -> Self {
        self.entitlements = Some(evaluator);
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Runs one pass at `now`. Only a failure to read the due set is returned
    /// as an error; every per-step failure is counted in the report.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<SchedulerReport, SchedulerError> {
        let stale_before = now - Duration::seconds(self.settings.claim_ttl_secs);
        let work = self
            .store
            .due_work(now, stale_before, self.settings.batch_size)
            .await
            .map_err(|err| {
                error!(?err, "sequence scheduler could not load due work");
                err
            })?;

        let pass = Pass {
            token: Uuid::new_v4(),
            now,
            stale_before,
            deadline: Instant::now() + TokioDuration::from_secs(self.settings.pass_budget_secs),
            remaining_steps: AtomicUsize::new(self.settings.max_steps_per_pass),
        };
        let candidates = work.len();

        let outcomes: Vec<SchedulerReport> = stream::iter(work)
            .map(|item| self.process(item, &pass))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = SchedulerReport::default();
        for outcome in outcomes {
            report.merge(outcome);
        }
        info!(
            pass = %pass.token,
            candidates,
            processed = report.processed,
            sent = report.sent,
            errors = report.errors,
            skipped = report.skipped,
            completed = report.completed,
            paused = report.paused,
            "sequence scheduler pass finished"
        );
        Ok(report)
    }

    async fn process(&self, item: DueWork, pass: &Pass) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        let enrollment = &item.enrollment;

        if !item.sequence.active {
            match self
                .store
                .set_enrollment_status(
                    enrollment.id,
                    &[EnrollmentStatus::Active],
                    EnrollmentStatus::Paused,
                    Some(SEQUENCE_DEACTIVATED),
                    pass.now,
                )
                .await
            {
                Ok(true) => {
                    info!(enrollment_id = %enrollment.id, sequence_id = %item.sequence.id, "paused enrollment of deactivated sequence");
                    report.paused += 1;
                    report.detail(
                        enrollment.id,
                        enrollment.current_step_index,
                        StepOutcome::Paused,
                        Some(SEQUENCE_DEACTIVATED),
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, enrollment_id = %enrollment.id, "failed to pause enrollment");
                    report.errors += 1;
                }
            }
            return report;
        }

        let Some(run) = item.run.clone() else {
            match self
                .store
                .set_enrollment_status(
                    enrollment.id,
                    &[EnrollmentStatus::Active],
                    EnrollmentStatus::Completed,
                    None,
                    pass.now,
                )
                .await
            {
                Ok(true) => {
                    debug!(enrollment_id = %enrollment.id, "enrollment has no remaining steps; completed");
                    report.completed += 1;
                    report.detail(
                        enrollment.id,
                        enrollment.current_step_index,
                        StepOutcome::Completed,
                        None,
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, enrollment_id = %enrollment.id, "failed to complete enrollment");
                    report.errors += 1;
                }
            }
            return report;
        };

        // A previous pass finished the step but lost the follow-up write.
        match run.status {
            StepStatus::Sent | StepStatus::Skipped => {
                debug!(enrollment_id = %enrollment.id, step_index = run.step_index, "advancing past finished step");
                self.advance(&item, run.step_index, pass, &mut report).await;
                return report;
            }
            StepStatus::Failed => {
                let reason = run.last_error.as_deref().unwrap_or("unknown error");
                self.pause(&item, &format!("step {} failed: {reason}", run.step_index), pass, &mut report)
                    .await;
                return report;
            }
            StepStatus::Pending | StepStatus::Due => {}
        }

        if !pass.take_budget() {
            debug!(enrollment_id = %enrollment.id, step_index = run.step_index, "pass budget exhausted; deferring step");
            return report;
        }

        match self
            .store
            .claim_step(run.id, pass.token, pass.now, pass.stale_before)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(enrollment_id = %enrollment.id, step_index = run.step_index, "step claimed by another pass");
                return report;
            }
            Err(err) => {
                warn!(?err, enrollment_id = %enrollment.id, step_index = run.step_index, "failed to claim step");
                report.errors += 1;
                return report;
            }
        }
        report.processed += 1;

        let Some(step) = item.step.as_ref() else {
            warn!(enrollment_id = %enrollment.id, step_index = run.step_index, "step no longer defined on sequence; skipping");
            self.skip(&item, run.id, run.step_index, "step removed from sequence", pass, &mut report)
                .await;
            return report;
        };

        if let Some(evaluator) = &self.entitlements {
            match evaluator
                .require_access_at(item.sequence.owner_user_id, step.channel.feature(), pass.now)
                .await
            {
                Ok(_) => {}
                Err(AccessError::Denied(denial)) => {
                    info!(
                        enrollment_id = %enrollment.id,
                        owner_user_id = %item.sequence.owner_user_id,
                        feature = %denial.feature,
                        "plan limit reached; skipping sequence step"
                    );
                    self.skip(&item, run.id, run.step_index, "plan limit reached", pass, &mut report)
                        .await;
                    return report;
                }
                Err(AccessError::Unavailable(reason)) => {
                    // Claim stays `due` and is picked up again once it goes stale.
                    warn!(%reason, enrollment_id = %enrollment.id, "entitlement check unavailable; deferring step");
                    report.errors += 1;
                    return report;
                }
            }
        }

        let Some(contact) = item.contact.as_ref() else {
            self.fail(&item, run.id, run.step_index, "contact not found".into(), pass, &mut report)
                .await;
            return report;
        };
        let message = match render_step(step, contact, enrollment) {
            Ok(message) => message,
            Err(err) => {
                self.fail(&item, run.id, run.step_index, err.to_string(), pass, &mut report)
                    .await;
                return report;
            }
        };
        let Some(destination) = contact.destination(step.channel) else {
            let reason = format!("contact has no {} destination", step.channel.as_str());
            self.fail(&item, run.id, run.step_index, reason, pass, &mut report)
                .await;
            return report;
        };

        let dispatch = time::timeout(
            TokioDuration::from_secs(self.settings.dispatch_timeout_secs),
            self.messenger.send(step.channel, destination, &message),
        )
        .await
        .unwrap_or(Err(DispatchError::Timeout));

        let receipt = match dispatch {
            Ok(receipt) => receipt,
            Err(err) => {
                self.fail(&item, run.id, run.step_index, err.to_string(), pass, &mut report)
                    .await;
                return report;
            }
        };

        // Written before the step is marked sent so an early callback finds it.
        let record = DeliveryRecord {
            provider_message_id: receipt.provider_message_id.clone(),
            enrollment_step_id: Some(run.id),
            claim_token: Some(pass.token),
            channel: step.channel,
            delivery_status: DeliveryStatus::Queued,
            error_code: None,
            metadata: json!({
                "enrollment_id": enrollment.id,
                "step_index": run.step_index,
            }),
            created_at: pass.now,
            updated_at: pass.now,
        };
        if let Err(err) = self.store.insert_delivery_record(&record).await {
            error!(?err, provider_message_id = %receipt.provider_message_id, "failed to store delivery record");
        }

        // Dispatched, so metered whatever happens to the claim.
        if let Some(evaluator) = &self.entitlements {
            evaluator.record(item.sequence.owner_user_id, step.channel.feature(), 1);
        }

        match self
            .store
            .finish_step(
                run.id,
                pass.token,
                StepStatus::Sent,
                Some(&receipt.provider_message_id),
                None,
                pass.now,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    enrollment_id = %enrollment.id,
                    step_index = run.step_index,
                    provider_message_id = %receipt.provider_message_id,
                    "step claim lost before it was marked sent; leaving it to its current owner"
                );
                return report;
            }
            Err(err) => {
                error!(?err, enrollment_id = %enrollment.id, "failed to mark step sent");
                report.errors += 1;
                return report;
            }
        }
        report.sent += 1;
        report.detail(enrollment.id, run.step_index, StepOutcome::Sent, None);
        self.advance(&item, run.step_index, pass, &mut report).await;

        info!(
            enrollment_id = %enrollment.id,
            step_index = run.step_index,
            channel = step.channel.as_str(),
            provider_message_id = %receipt.provider_message_id,
            "sequence step sent"
        );
        report
    }

    async fn skip(
        &self,
        item: &DueWork,
        step_id: Uuid,
        step_index: i32,
        reason: &str,
        pass: &Pass,
        report: &mut SchedulerReport,
    ) {
        match self
            .store
            .finish_step(step_id, pass.token, StepStatus::Skipped, None, Some(reason), pass.now)
            .await
        {
            Ok(true) => {
                report.skipped += 1;
                report.detail(item.enrollment.id, step_index, StepOutcome::Skipped, Some(reason));
                self.advance(item, step_index, pass, report).await;
            }
            Ok(false) => {
                warn!(enrollment_id = %item.enrollment.id, step_index, "step claim lost before it was marked skipped");
            }
            Err(err) => {
                warn!(?err, enrollment_id = %item.enrollment.id, "failed to mark step skipped");
                report.errors += 1;
            }
        }
    }

    /// Marks the step failed and pauses the enrollment until it is resumed.
    async fn fail(
        &self,
        item: &DueWork,
        step_id: Uuid,
        step_index: i32,
        reason: String,
        pass: &Pass,
        report: &mut SchedulerReport,
    ) {
        report.errors += 1;
        warn!(
            enrollment_id = %item.enrollment.id,
            step_index,
            %reason,
            "sequence step failed"
        );
        match self
            .store
            .finish_step(step_id, pass.token, StepStatus::Failed, None, Some(&reason), pass.now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(enrollment_id = %item.enrollment.id, step_index, "step claim lost before it was marked failed");
                return;
            }
            Err(err) => {
                error!(?err, enrollment_id = %item.enrollment.id, "failed to mark step failed");
                return;
            }
        }
        report.detail(item.enrollment.id, step_index, StepOutcome::Failed, Some(&reason));
        let stop_reason = format!("step {step_index} failed: {reason}");
        self.pause(item, &stop_reason, pass, report).await;
    }

    async fn pause(&self, item: &DueWork, reason: &str, pass: &Pass, report: &mut SchedulerReport) {
        match self
            .store
            .set_enrollment_status(
                item.enrollment.id,
                &[EnrollmentStatus::Active],
                EnrollmentStatus::Paused,
                Some(reason),
                pass.now,
            )
            .await
        {
            Ok(true) => {
                report.paused += 1;
                report.detail(
                    item.enrollment.id,
                    item.enrollment.current_step_index,
                    StepOutcome::Paused,
                    Some(reason),
                );
            }
            Ok(false) => {}
            Err(err) => error!(?err, enrollment_id = %item.enrollment.id, "failed to pause enrollment"),
        }
    }

    async fn advance(&self, item: &DueWork, step_index: i32, pass: &Pass, report: &mut SchedulerReport) {
        match self
            .store
            .advance_enrollment(item.enrollment.id, step_index, item.total_steps, pass.now)
            .await
        {
            Ok(true) if step_index + 1 >= item.total_steps => {
                report.completed += 1;
                report.detail(item.enrollment.id, step_index, StepOutcome::Completed, None);
            }
            Ok(true) => {}
            Ok(false) => debug!(enrollment_id = %item.enrollment.id, step_index, "enrollment already advanced"),
            Err(err) => {
                error!(?err, enrollment_id = %item.enrollment.id, "failed to advance enrollment");
                report.errors += 1;
            }
        }
    }
}

/// key: sequence-scheduler-loop -> periodic in-process trigger
pub fn spawn(scheduler: Arc<SequenceScheduler>) -> Option<JoinHandle<()>> {
    let interval_secs = scheduler.settings().interval_secs;
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = scheduler.run_pass(Utc::now()).await {
                warn!(?err, "sequence scheduler tick failed");
            }
        }
    }))
}
