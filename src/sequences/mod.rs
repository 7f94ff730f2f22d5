pub mod api;
pub mod delivery;
pub mod enrollments;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod template;

pub use api::{
    contact_booked as sequences_contact_booked,
    delivery_status_callback as sequences_delivery_status_callback,
    enroll_contact as sequences_enroll_contact, get_enrollment as sequences_get_enrollment,
    inbound_sms as sequences_inbound_sms,
    resume_enrollment as sequences_resume_enrollment, run_scheduler as sequences_run_scheduler,
    stop_enrollment as sequences_stop_enrollment,
};
pub use delivery::{CallbackOutcome, DeliveryCorrelator};
pub use enrollments::{EnrollmentError, EnrollmentService};
pub use models::{
    Channel, Contact, DeliveryRecord, DeliveryStatus, DueWork, Enrollment, EnrollmentStatus,
    EnrollmentStep, SchedulerReport, Sequence, SequenceStep, StepDetail, StepOutcome, StepStatus,
};
pub use scheduler::{spawn as spawn_sequence_scheduler, SchedulerError, SequenceScheduler};
pub use store::SequenceStore;
pub use template::{render_step, RenderError, RenderedMessage};
