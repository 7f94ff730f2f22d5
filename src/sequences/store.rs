use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::StoreError;

use super::models::{
    Contact, DeliveryRecord, DeliveryStatus, DueWork, Enrollment, EnrollmentStatus,
    EnrollmentStep, Sequence, SequenceStep, StepStatus,
};

/// key: sequence-store -> sequences, enrollments, step claims, deliveries
///
/// Every state change is a conditional write whose boolean result tells the
/// caller whether it won; overlapping scheduler passes rely on nothing else.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn create_sequence(
        &self,
        sequence: &Sequence,
        steps: &[SequenceStep],
    ) -> Result<(), StoreError>;

    async fn set_sequence_active(&self, sequence_id: Uuid, active: bool)
        -> Result<bool, StoreError>;

    async fn sequence(
        &self,
        sequence_id: Uuid,
    ) -> Result<Option<(Sequence, Vec<SequenceStep>)>, StoreError>;

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError>;

    async fn contact(&self, contact_id: Uuid) -> Result<Option<Contact>, StoreError>;

    async fn contacts_by_phone(&self, phone: &str) -> Result<Vec<Contact>, StoreError>;

    /// Active and paused enrollments of `contact_ids`, each with its sequence.
    async fn in_flight_enrollments(
        &self,
        contact_ids: &[Uuid],
    ) -> Result<Vec<(Enrollment, Sequence)>, StoreError>;

    async fn active_enrollment_exists(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Inserts the enrollment and its per-step rows atomically. Returns false
    /// when an active enrollment for the same contact and sequence already exists.
    async fn insert_enrollment(
        &self,
        enrollment: &Enrollment,
        steps: &[EnrollmentStep],
    ) -> Result<bool, StoreError>;

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError>;

    async fn enrollment_steps(&self, enrollment_id: Uuid)
        -> Result<Vec<EnrollmentStep>, StoreError>;

    /// Active enrollments needing attention at `now`: the current step is
    /// pending and its wait offset has elapsed, or it is `due` with a claim
    /// older than `stale_before`, or it already reached a terminal status
    /// without the enrollment moving on. Enrollments with no step left or
    /// whose sequence has been deactivated are always returned.
    async fn due_work(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DueWork>, StoreError>;

    /// `pending -> due` (or re-claim of a stale `due`) tagged with `token`.
    async fn claim_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `due -> status` for the holder of `token` only.
    async fn finish_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        status: StepStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Moves `current_step_index` from `from_index` to `from_index + 1`,
    /// completing the enrollment when that exhausts `total_steps`.
    async fn advance_enrollment(
        &self,
        enrollment_id: Uuid,
        from_index: i32,
        total_steps: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Changes the status of an enrollment currently in one of `from`.
    async fn set_enrollment_status(
        &self,
        enrollment_id: Uuid,
        from: &[EnrollmentStatus],
        status: EnrollmentStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Idempotent on `provider_message_id`.
    async fn insert_delivery_record(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    async fn delivery_record(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Applies `status` only when the record's current status is in
    /// `allowed_from`; returns the updated record.
    async fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        error_code: Option<&str>,
        metadata: Option<&Value>,
        allowed_from: &[DeliveryStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Marks the step behind a permanently failed delivery `failed`. Matches a
    /// `sent` step that recorded `provider_message_id`, or a step still `due`
    /// under `claim_token` when the callback lands before the sent write.
    async fn fail_delivered_step(
        &self,
        step_id: Uuid,
        provider_message_id: &str,
        claim_token: Option<Uuid>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
