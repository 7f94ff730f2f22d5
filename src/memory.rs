//! In-process store backends used by tests and by `STORE_BACKEND=memory`.
//!
//! Every conditional write takes the same lock as the read it depends on, so
//! the compare-and-set semantics match the Postgres implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::billing::{BillingStore, FeatureType, PeriodKey, Subscription, UsageEntry};
use crate::db::StoreError;
use crate::sequences::{
    Contact, DeliveryRecord, DeliveryStatus, DueWork, Enrollment, EnrollmentStatus,
    EnrollmentStep, Sequence, SequenceStep, SequenceStore, StepStatus,
};

fn outage(flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable("memory store marked unavailable".into()));
    }
    Ok(())
}

/// key: memory-billing -> subscriptions + usage counters on dashmap
#[derive(Default)]
pub struct MemoryBillingStore {
    subscriptions: DashMap<Uuid, Subscription>,
    usage: DashMap<(Uuid, FeatureType, PeriodKey), i64>,
    entries: Mutex<Vec<UsageEntry>>,
    unavailable: AtomicBool,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn subscription_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        outage(&self.unavailable)?;
        Ok(self.subscriptions.get(&user_id).map(|row| row.clone()))
    }

    async fn subscription_by_external_id(
        &self,
        external_billing_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        outage(&self.unavailable)?;
        Ok(self
            .subscriptions
            .iter()
            .find(|row| row.external_billing_id == external_billing_id)
            .map(|row| row.clone()))
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Subscription>, StoreError> {
        outage(&self.unavailable)?;
        match self.subscriptions.entry(subscription.user_id) {
            Entry::Vacant(vacant) => {
                if expected_updated_at.is_some() {
                    return Ok(None);
                }
                vacant.insert(subscription.clone());
                Ok(Some(subscription.clone()))
            }
            Entry::Occupied(mut occupied) => {
                if Some(occupied.get().updated_at) != expected_updated_at {
                    return Ok(None);
                }
                let mut next = subscription.clone();
                next.created_at = occupied.get().created_at;
                occupied.insert(next.clone());
                Ok(Some(next))
            }
        }
    }

    async fn append_usage(&self, entry: &UsageEntry) -> Result<(), StoreError> {
        outage(&self.unavailable)?;
        *self
            .usage
            .entry((entry.user_id, entry.feature, entry.period_key.clone()))
            .or_insert(0) += entry.quantity;
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn sum_usage(
        &self,
        user_id: Uuid,
        feature: FeatureType,
        period: &PeriodKey,
    ) -> Result<i64, StoreError> {
        outage(&self.unavailable)?;
        Ok(self
            .usage
            .get(&(user_id, feature, period.clone()))
            .map(|total| *total)
            .unwrap_or(0))
    }

    async fn usage_by_feature(
        &self,
        user_id: Uuid,
        period: &PeriodKey,
    ) -> Result<HashMap<FeatureType, i64>, StoreError> {
        outage(&self.unavailable)?;
        Ok(self
            .usage
            .iter()
            .filter(|row| row.key().0 == user_id && &row.key().2 == period)
            .map(|row| (row.key().1, *row.value()))
            .collect())
    }
}

#[derive(Default)]
struct SequenceState {
    sequences: HashMap<Uuid, Sequence>,
    steps: HashMap<Uuid, Vec<SequenceStep>>,
    contacts: HashMap<Uuid, Contact>,
    enrollments: HashMap<Uuid, Enrollment>,
    runs: HashMap<Uuid, EnrollmentStep>,
    deliveries: HashMap<String, DeliveryRecord>,
}

impl SequenceState {
    fn runs_for(&self, enrollment_id: Uuid) -> Vec<EnrollmentStep> {
        let mut runs: Vec<_> = self
            .runs
            .values()
            .filter(|run| run.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.step_index);
        runs
    }

    fn in_flight(&self, contact_id: Uuid, sequence_id: Uuid) -> bool {
        self.enrollments.values().any(|enrollment| {
            enrollment.contact_id == contact_id
                && enrollment.sequence_id == sequence_id
                && matches!(
                    enrollment.enrollment_status,
                    EnrollmentStatus::Active | EnrollmentStatus::Paused
                )
        })
    }
}

/// key: memory-sequences -> enrollments, claims, deliveries behind one lock
#[derive(Default)]
pub struct MemorySequenceStore {
    state: Mutex<SequenceState>,
    unavailable: AtomicBool,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, SequenceState>, StoreError> {
        outage(&self.unavailable)?;
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory sequence store poisoned".into()))
    }
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    async fn create_sequence(
        &self,
        sequence: &Sequence,
        steps: &[SequenceStep],
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let mut steps = steps.to_vec();
        steps.sort_by_key(|step| step.step_index);
        state.sequences.insert(sequence.id, sequence.clone());
        state.steps.insert(sequence.id, steps);
        Ok(())
    }

    async fn set_sequence_active(
        &self,
        sequence_id: Uuid,
        active: bool,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        Ok(match state.sequences.get_mut(&sequence_id) {
            Some(sequence) => {
                sequence.active = active;
                true
            }
            None => false,
        })
    }

    async fn sequence(
        &self,
        sequence_id: Uuid,
    ) -> Result<Option<(Sequence, Vec<SequenceStep>)>, StoreError> {
        let state = self.state()?;
        Ok(state.sequences.get(&sequence_id).map(|sequence| {
            let steps = state.steps.get(&sequence_id).cloned().unwrap_or_default();
            (sequence.clone(), steps)
        }))
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.state()?.contacts.insert(contact.id, contact.clone());
        Ok(())
    }

    async fn contact(&self, contact_id: Uuid) -> Result<Option<Contact>, StoreError> {
        Ok(self.state()?.contacts.get(&contact_id).cloned())
    }

    async fn contacts_by_phone(&self, phone: &str) -> Result<Vec<Contact>, StoreError> {
        Ok(self
            .state()?
            .contacts
            .values()
            .filter(|contact| contact.phone.as_deref() == Some(phone))
            .cloned()
            .collect())
    }

    async fn in_flight_enrollments(
        &self,
        contact_ids: &[Uuid],
    ) -> Result<Vec<(Enrollment, Sequence)>, StoreError> {
        let state = self.state()?;
        let mut found: Vec<_> = state
            .enrollments
            .values()
            .filter(|enrollment| {
                contact_ids.contains(&enrollment.contact_id)
                    && matches!(
                        enrollment.enrollment_status,
                        EnrollmentStatus::Active | EnrollmentStatus::Paused
                    )
            })
            .filter_map(|enrollment| {
                state
                    .sequences
                    .get(&enrollment.sequence_id)
                    .map(|sequence| (enrollment.clone(), sequence.clone()))
            })
            .collect();
        found.sort_by_key(|(enrollment, _)| enrollment.enrolled_at);
        Ok(found)
    }

    async fn active_enrollment_exists(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self.state()?.in_flight(contact_id, sequence_id))
    }

    async fn insert_enrollment(
        &self,
        enrollment: &Enrollment,
        steps: &[EnrollmentStep],
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if state.in_flight(enrollment.contact_id, enrollment.sequence_id)
            || state.enrollments.contains_key(&enrollment.id)
        {
            return Ok(false);
        }
        state.enrollments.insert(enrollment.id, enrollment.clone());
        for step in steps {
            state.runs.insert(step.id, step.clone());
        }
        Ok(true)
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.state()?.enrollments.get(&enrollment_id).cloned())
    }

    async fn enrollment_steps(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<EnrollmentStep>, StoreError> {
        Ok(self.state()?.runs_for(enrollment_id))
    }

    async fn due_work(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DueWork>, StoreError> {
        let state = self.state()?;
        let mut work = Vec::new();
        for enrollment in state.enrollments.values() {
            if enrollment.enrollment_status != EnrollmentStatus::Active {
                continue;
            }
            let Some(sequence) = state.sequences.get(&enrollment.sequence_id) else {
                continue;
            };
            let step = state.steps.get(&sequence.id).and_then(|steps| {
                steps
                    .iter()
                    .find(|step| step.step_index == enrollment.current_step_index)
                    .cloned()
            });
            let runs = state.runs_for(enrollment.id);
            let run = runs
                .iter()
                .find(|run| run.step_index == enrollment.current_step_index)
                .cloned();

            let needs_attention = !sequence.active
                || match &run {
                    None => true,
                    Some(run) => match run.status {
                        StepStatus::Sent | StepStatus::Skipped | StepStatus::Failed => true,
                        StepStatus::Pending => {
                            let wait = step
                                .as_ref()
                                .map(|step| step.wait_offset)
                                .unwrap_or_else(chrono::Duration::zero);
                            enrollment.step_anchor_at + wait <= now
                        }
                        StepStatus::Due => run
                            .claimed_at
                            .map(|claimed_at| claimed_at < stale_before)
                            .unwrap_or(true),
                    },
                };
            if !needs_attention {
                continue;
            }

            work.push(DueWork {
                enrollment: enrollment.clone(),
                sequence: sequence.clone(),
                step,
                run,
                contact: state.contacts.get(&enrollment.contact_id).cloned(),
                total_steps: runs.len() as i32,
            });
        }
        work.sort_by_key(|item| item.enrollment.step_anchor_at);
        work.truncate(limit.max(0) as usize);
        Ok(work)
    }

    async fn claim_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(run) = state.runs.get_mut(&step_id) else {
            return Ok(false);
        };
        let claimable = match run.status {
            StepStatus::Pending => true,
            StepStatus::Due => run
                .claimed_at
                .map(|claimed_at| claimed_at < stale_before)
                .unwrap_or(true),
            _ => false,
        };
        if !claimable {
            return Ok(false);
        }
        run.status = StepStatus::Due;
        run.claim_token = Some(token);
        run.claimed_at = Some(now);
        Ok(true)
    }

    async fn finish_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        status: StepStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(run) = state.runs.get_mut(&step_id) else {
            return Ok(false);
        };
        if run.status != StepStatus::Due || run.claim_token != Some(token) {
            return Ok(false);
        }
        run.status = status;
        if let Some(message_id) = provider_message_id {
            run.provider_message_id = Some(message_id.to_string());
        }
        run.last_error = error.map(str::to_string);
        run.completed_at = Some(now);
        Ok(true)
    }

    async fn advance_enrollment(
        &self,
        enrollment_id: Uuid,
        from_index: i32,
        total_steps: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(enrollment) = state.enrollments.get_mut(&enrollment_id) else {
            return Ok(false);
        };
        let movable = matches!(
            enrollment.enrollment_status,
            EnrollmentStatus::Active | EnrollmentStatus::Paused
        );
        if !movable || enrollment.current_step_index != from_index {
            return Ok(false);
        }
        enrollment.current_step_index = from_index + 1;
        if enrollment.current_step_index >= total_steps {
            enrollment.enrollment_status = EnrollmentStatus::Completed;
        }
        enrollment.step_anchor_at = now;
        enrollment.updated_at = now;
        Ok(true)
    }

    async fn set_enrollment_status(
        &self,
        enrollment_id: Uuid,
        from: &[EnrollmentStatus],
        status: EnrollmentStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(enrollment) = state.enrollments.get_mut(&enrollment_id) else {
            return Ok(false);
        };
        if !from.contains(&enrollment.enrollment_status) {
            return Ok(false);
        }
        enrollment.enrollment_status = status;
        enrollment.stop_reason = reason.map(str::to_string);
        enrollment.updated_at = now;
        Ok(true)
    }

    async fn insert_delivery_record(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.state()?
            .deliveries
            .entry(record.provider_message_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn delivery_record(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.state()?.deliveries.get(provider_message_id).cloned())
    }

    async fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        error_code: Option<&str>,
        metadata: Option<&Value>,
        allowed_from: &[DeliveryStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let mut state = self.state()?;
        let Some(record) = state.deliveries.get_mut(provider_message_id) else {
            return Ok(None);
        };
        if !allowed_from.contains(&record.delivery_status) {
            return Ok(None);
        }
        record.delivery_status = status;
        if let Some(code) = error_code {
            record.error_code = Some(code.to_string());
        }
        if let Some(Value::Object(incoming)) = metadata {
            if !record.metadata.is_object() {
                record.metadata = Value::Object(Default::default());
            }
            if let Value::Object(existing) = &mut record.metadata {
                for (key, value) in incoming {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn fail_delivered_step(
        &self,
        step_id: Uuid,
        provider_message_id: &str,
        claim_token: Option<Uuid>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        let Some(run) = state.runs.get_mut(&step_id) else {
            return Ok(false);
        };
        let matches = match run.status {
            StepStatus::Sent => run.provider_message_id.as_deref() == Some(provider_message_id),
            StepStatus::Due => claim_token.is_some() && run.claim_token == claim_token,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        run.status = StepStatus::Failed;
        run.last_error = Some(error.to_string());
        run.completed_at.get_or_insert(now);
        Ok(true)
    }
}
