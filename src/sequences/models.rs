use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::billing::FeatureType;

/// key: sequence-models -> sequences,enrollments,deliveries
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Voice,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Voice => "voice",
            Channel::Email => "email",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sms" => Some(Self::Sms),
            "voice" => Some(Self::Voice),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    /// Metered feature consumed by one dispatch on this channel.
    pub fn feature(&self) -> FeatureType {
        match self {
            Channel::Sms => FeatureType::SmsMessages,
            Channel::Voice => FeatureType::VoiceCalls,
            Channel::Email => FeatureType::EmailMessages,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Due,
    Sent,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Due => "due",
            StepStatus::Sent => "sent",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "due" => Some(Self::Due),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Paused,
    Canceled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "paused" => Some(Self::Paused),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sequence {
    pub id: Uuid,
    /// Account whose plan meters dispatches from this sequence.
    pub owner_user_id: Uuid,
    pub name: String,
    pub active: bool,
    /// An inbound reply from the contact cancels the enrollment.
    #[serde(default = "enabled")]
    pub stop_on_reply: bool,
    /// A booked appointment cancels the enrollment.
    #[serde(default = "enabled")]
    pub stop_on_booking: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SequenceStep {
    pub sequence_id: Uuid,
    pub step_index: i32,
    /// Delay after the enrollment (first step) or the previous step reaching a
    /// terminal status.
    #[serde(with = "duration_secs")]
    pub wait_offset: Duration,
    pub channel: Channel,
    pub template: String,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub sequence_id: Uuid,
    pub enrolled_at: DateTime<Utc>,
    pub current_step_index: i32,
    pub enrollment_status: EnrollmentStatus,
    /// Instant the wait offset of the current step counts from.
    pub step_anchor_at: DateTime<Utc>,
    pub stop_reason: Option<String>,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

/// Per-enrollment execution state of one sequence step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentStep {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_index: i32,
    pub status: StepStatus,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::Sms | Channel::Voice => self.phone.as_deref(),
            Channel::Email => self.email.as_deref(),
        };
        value.map(str::trim).filter(|value| !value.is_empty())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
    Undelivered,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Queued,
        DeliveryStatus::Sent,
        DeliveryStatus::Delivered,
        DeliveryStatus::Read,
        DeliveryStatus::Failed,
        DeliveryStatus::Undelivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Undelivered => "undelivered",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Maps SMS message and voice call status vocabularies.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accepted" | "scheduled" | "queued" | "sending" | "initiated" | "ringing" => {
                Some(Self::Queued)
            }
            "sent" | "in-progress" | "answered" => Some(Self::Sent),
            "delivered" | "completed" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" | "busy" | "no-answer" | "canceled" => Some(Self::Failed),
            "undelivered" => Some(Self::Undelivered),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Queued => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed | DeliveryStatus::Undelivered => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Read | DeliveryStatus::Failed | DeliveryStatus::Undelivered
        )
    }

    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Undelivered)
    }

    /// Whether a record currently in `self` may be overwritten with `next`.
    /// Re-applying the same status is allowed so replays converge; late
    /// callbacks never move a record backwards.
    pub fn can_supersede(&self, next: DeliveryStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if *self == DeliveryStatus::Delivered {
            return next == DeliveryStatus::Read;
        }
        next.rank() > self.rank()
    }

    /// Statuses from which a record may move to `next`.
    pub fn predecessors(next: DeliveryStatus) -> Vec<DeliveryStatus> {
        Self::ALL
            .into_iter()
            .filter(|current| current.can_supersede(next))
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub provider_message_id: String,
    pub enrollment_step_id: Option<Uuid>,
    pub claim_token: Option<Uuid>,
    pub channel: Channel,
    pub delivery_status: DeliveryStatus,
    pub error_code: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Sent,
    Skipped,
    Failed,
    Paused,
    Completed,
}

/// What a pass did to one enrollment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDetail {
    pub enrollment_id: Uuid,
    pub step_index: i32,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate outcome of one scheduler pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerReport {
    pub processed: u32,
    pub sent: u32,
    pub errors: u32,
    pub skipped: u32,
    pub completed: u32,
    pub paused: u32,
    #[serde(default)]
    pub details: Vec<StepDetail>,
}

impl SchedulerReport {
    pub fn merge(&mut self, other: SchedulerReport) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.errors += other.errors;
        self.skipped += other.skipped;
        self.completed += other.completed;
        self.paused += other.paused;
        self.details.extend(other.details);
    }

    pub(crate) fn detail(
        &mut self,
        enrollment_id: Uuid,
        step_index: i32,
        outcome: StepOutcome,
        reason: Option<&str>,
    ) {
        self.details.push(StepDetail {
            enrollment_id,
            step_index,
            outcome,
            reason: reason.map(str::to_string),
        });
    }
}

/// One enrollment surfaced by the due-work query, joined with what the
/// scheduler needs to act on it.
#[derive(Clone, Debug)]
pub struct DueWork {
    pub enrollment: Enrollment,
    pub sequence: Sequence,
    pub step: Option<SequenceStep>,
    pub run: Option<EnrollmentStep>,
    pub contact: Option<Contact>,
    pub total_steps: i32,
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        if seconds < 0 {
            return Err(serde::de::Error::custom("wait offset must be non-negative"));
        }
        Ok(Duration::seconds(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statuses_map_for_sms_and_voice() {
        assert_eq!(DeliveryStatus::from_provider("delivered"), Some(DeliveryStatus::Delivered));
        assert_eq!(DeliveryStatus::from_provider("completed"), Some(DeliveryStatus::Delivered));
        assert_eq!(DeliveryStatus::from_provider("no-answer"), Some(DeliveryStatus::Failed));
        assert_eq!(DeliveryStatus::from_provider("in-progress"), Some(DeliveryStatus::Sent));
        assert_eq!(DeliveryStatus::from_provider("Ringing"), Some(DeliveryStatus::Queued));
        assert_eq!(DeliveryStatus::from_provider("exploded"), None);
    }

    #[test]
    fn statuses_only_move_forward() {
        use DeliveryStatus::*;
        assert!(Queued.can_supersede(Delivered));
        assert!(Sent.can_supersede(Undelivered));
        assert!(Delivered.can_supersede(Read));
        assert!(Delivered.can_supersede(Delivered));
        assert!(!Delivered.can_supersede(Failed));
        assert!(!Delivered.can_supersede(Sent));
        assert!(!Failed.can_supersede(Delivered));
        assert!(!Read.can_supersede(Delivered));
        assert_eq!(DeliveryStatus::predecessors(Sent), vec![Queued, Sent]);
    }

    #[test]
    fn contact_destination_follows_channel() {
        let contact = Contact {
            id: Uuid::nil(),
            name: "Ada Lovelace".into(),
            phone: Some("+15550100".into()),
            email: Some("  ".into()),
        };
        assert_eq!(contact.destination(Channel::Voice), Some("+15550100"));
        assert_eq!(contact.destination(Channel::Email), None);
    }

    #[test]
    fn wait_offsets_round_trip_as_seconds() {
        let step: SequenceStep = serde_json::from_value(serde_json::json!({
            "sequence_id": Uuid::nil(),
            "step_index": 0,
            "wait_offset": 3600,
            "channel": "sms",
            "template": "Hi {{first_name}}"
        }))
        .unwrap();
        assert_eq!(step.wait_offset, Duration::hours(1));
        assert!(serde_json::from_value::<SequenceStep>(serde_json::json!({
            "sequence_id": Uuid::nil(),
            "step_index": 0,
            "wait_offset": -5,
            "channel": "sms",
            "template": ""
        }))
        .is_err());
    }
}
