use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::StoreError;

use super::models::{Enrollment, EnrollmentStatus, EnrollmentStep, Sequence, StepStatus};
use super::store::SequenceStore;

const CUSTOMER_REPLY: &str = "customer_reply";
const UNSUBSCRIBED: &str = "unsubscribed";
const APPOINTMENT_BOOKED: &str = "appointment_booked";

const STOP_KEYWORDS: [&str; 4] = ["stop", "unsubscribe", "cancel", "quit"];

/// Whether an inbound message body is an opt-out.
fn is_opt_out(body: &str) -> bool {
    let body = body.trim().to_lowercase();
    STOP_KEYWORDS.contains(&body.as_str())
}

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("sequence {0} not found")]
    SequenceNotFound(Uuid),
    #[error("sequence {0} is not active")]
    SequenceInactive(Uuid),
    #[error("sequence {0} has no steps")]
    NoSteps(Uuid),
    #[error("contact {0} not found")]
    ContactNotFound(Uuid),
    #[error("contact is already enrolled in this sequence")]
    AlreadyEnrolled,
    #[error("enrollment {0} not found")]
    EnrollmentNotFound(Uuid),
    #[error("enrollment is {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// key: sequence-enrollments -> enroll, stop, resume
#[derive(Clone)]
pub struct EnrollmentService {
    store: Arc<dyn SequenceStore>,
}

impl EnrollmentService {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store }
    }

    /// Enrolls a contact and materialises one pending row per sequence step.
    pub async fn enroll(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let (sequence, steps) = self
            .store
            .sequence(sequence_id)
            .await?
            .ok_or(EnrollmentError::SequenceNotFound(sequence_id))?;
        if !sequence.active {
            return Err(EnrollmentError::SequenceInactive(sequence_id));
        }
        if steps.is_empty() {
            return Err(EnrollmentError::NoSteps(sequence_id));
        }
        if self.store.contact(contact_id).await?.is_none() {
            return Err(EnrollmentError::ContactNotFound(contact_id));
        }
        if self
            .store
            .active_enrollment_exists(contact_id, sequence_id)
            .await?
        {
            return Err(EnrollmentError::AlreadyEnrolled);
        }

        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            contact_id,
            sequence_id,
            enrolled_at: now,
            current_step_index: 0,
            enrollment_status: EnrollmentStatus::Active,
            step_anchor_at: now,
            stop_reason: None,
            metadata: if metadata.is_null() {
                Value::Object(Default::default())
            } else {
                metadata
            },
            updated_at: now,
        };
        let runs: Vec<EnrollmentStep> = steps
            .iter()
            .map(|step| EnrollmentStep {
                id: Uuid::new_v4(),
                enrollment_id: enrollment.id,
                step_index: step.step_index,
                status: StepStatus::Pending,
                claim_token: None,
                claimed_at: None,
                completed_at: None,
                provider_message_id: None,
                last_error: None,
            })
            .collect();

        if !self.store.insert_enrollment(&enrollment, &runs).await? {
            return Err(EnrollmentError::AlreadyEnrolled);
        }
        info!(
            enrollment_id = %enrollment.id,
            %contact_id,
            %sequence_id,
            steps = runs.len(),
            "contact enrolled in sequence"
        );
        Ok(enrollment)
    }

    /// Cancels an active or paused enrollment. Stopping a canceled enrollment
    /// is a no-op.
    pub async fn stop_enrollment(
        &self,
        enrollment_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let stopped = self
            .store
            .set_enrollment_status(
                enrollment_id,
                &[EnrollmentStatus::Active, EnrollmentStatus::Paused],
                EnrollmentStatus::Canceled,
                Some(reason.unwrap_or("stopped")),
                now,
            )
            .await?;
        let enrollment = self.load(enrollment_id).await?;
        if !stopped && enrollment.enrollment_status == EnrollmentStatus::Completed {
            return Err(EnrollmentError::InvalidState("completed"));
        }
        if stopped {
            info!(%enrollment_id, reason = reason.unwrap_or("stopped"), "enrollment stopped");
        }
        Ok(enrollment)
    }

    /// Clears a paused enrollment. A failed current step is passed over so the
    /// sequence continues with the next one.
    pub async fn resume_enrollment(
        &self,
        enrollment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self.load(enrollment_id).await?;
        match enrollment.enrollment_status {
            EnrollmentStatus::Paused => {}
            EnrollmentStatus::Active => return Ok(enrollment),
            other => return Err(EnrollmentError::InvalidState(other.as_str())),
        }

        let (sequence, _) = self
            .store
            .sequence(enrollment.sequence_id)
            .await?
            .ok_or(EnrollmentError::SequenceNotFound(enrollment.sequence_id))?;
        if !sequence.active {
            return Err(EnrollmentError::SequenceInactive(sequence.id));
        }

        let runs = self.store.enrollment_steps(enrollment_id).await?;
        let current_failed = runs.iter().any(|run| {
            run.step_index == enrollment.current_step_index && run.status == StepStatus::Failed
        });
        if current_failed {
            self.store
                .advance_enrollment(
                    enrollment_id,
                    enrollment.current_step_index,
                    runs.len() as i32,
                    now,
                )
                .await?;
        }
        self.store
            .set_enrollment_status(
                enrollment_id,
                &[EnrollmentStatus::Paused],
                EnrollmentStatus::Active,
                None,
                now,
            )
            .await?;

        let resumed = self.load(enrollment_id).await?;
        info!(
            %enrollment_id,
            skipped_failed_step = current_failed,
            status = resumed.enrollment_status.as_str(),
            current_step_index = resumed.current_step_index,
            "enrollment resumed"
        );
        Ok(resumed)
    }

    /// Reacts to an inbound message from `phone`. An opt-out cancels every
    /// in-flight enrollment of the sender; any other reply cancels those whose
    /// sequence stops on reply. Returns the canceled enrollments.
    pub async fn stop_for_inbound_message(
        &self,
        phone: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>, EnrollmentError> {
        let contacts = self.store.contacts_by_phone(phone).await?;
        if contacts.is_empty() {
            info!("inbound message from unknown number");
            return Ok(Vec::new());
        }
        let contact_ids: Vec<Uuid> = contacts.iter().map(|contact| contact.id).collect();
        if is_opt_out(body) {
            self.stop_matching(&contact_ids, UNSUBSCRIBED, |_| true, now)
                .await
        } else {
            self.stop_matching(&contact_ids, CUSTOMER_REPLY, |sequence| sequence.stop_on_reply, now)
                .await
        }
    }

    /// Cancels the contact's enrollments in sequences that stop on booking.
    pub async fn stop_for_booking(
        &self,
        contact_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>, EnrollmentError> {
        if self.store.contact(contact_id).await?.is_none() {
            return Err(EnrollmentError::ContactNotFound(contact_id));
        }
        self.stop_matching(
            &[contact_id],
            APPOINTMENT_BOOKED,
            |sequence| sequence.stop_on_booking,
            now,
        )
        .await
    }

    async fn stop_matching(
        &self,
        contact_ids: &[Uuid],
        reason: &str,
        applies: impl Fn(&Sequence) -> bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>, EnrollmentError> {
        let mut stopped = Vec::new();
        for (enrollment, sequence) in self.store.in_flight_enrollments(contact_ids).await? {
            if !applies(&sequence) {
                continue;
            }
            match self.stop_enrollment(enrollment.id, Some(reason), now).await {
                Ok(enrollment) if enrollment.enrollment_status == EnrollmentStatus::Canceled => {
                    stopped.push(enrollment)
                }
                Ok(_) => {}
                // Finished between the lookup and the write.
                Err(EnrollmentError::InvalidState(state)) => {
                    warn!(enrollment_id = %enrollment.id, state, "enrollment not stopped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(stopped)
    }

    pub async fn enrollment_with_steps(
        &self,
        enrollment_id: Uuid,
    ) -> Result<(Enrollment, Vec<EnrollmentStep>), EnrollmentError> {
        let enrollment = self.load(enrollment_id).await?;
        let steps = self.store.enrollment_steps(enrollment_id).await?;
        Ok((enrollment, steps))
    }

    async fn load(&self, enrollment_id: Uuid) -> Result<Enrollment, EnrollmentError> {
        self.store
            .enrollment(enrollment_id)
            .await?
            .ok_or(EnrollmentError::EnrollmentNotFound(enrollment_id))
    }
}
