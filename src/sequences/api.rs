use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Form, Path},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderName, StatusCode,
    },
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::delivery::DeliveryCorrelator;
use super::enrollments::EnrollmentService;
use super::models::{Enrollment, EnrollmentStep, SchedulerReport};
use super::scheduler::SequenceScheduler;

type HmacSha256 = Hmac<Sha256>;

const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>";

/// Compares the presented bearer token with `secret` in constant time.
fn bearer_matches(presented: Option<&str>, secret: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let digest = |value: &str| {
        HmacSha256::new_from_slice(secret.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (digest(secret), digest(presented)) {
        (Ok(expected), Ok(mac)) => mac.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

/// key: sequences-api -> cron trigger, provider callbacks, enrollment control
pub async fn run_scheduler(
    Extension(scheduler): Extension<Arc<SequenceScheduler>>,
    headers: HeaderMap,
) -> AppResult<Json<SchedulerReport>> {
    if let Some(secret) = scheduler.settings().cron_secret.as_deref() {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if !bearer_matches(presented, secret) {
            warn!("sequence scheduler trigger rejected: bad cron secret");
            return Err(AppError::Unauthorized);
        }
    }
    let report = scheduler.run_pass(Utc::now()).await.map_err(|err| {
        error!(?err, "sequence scheduler pass failed");
        AppError::Unavailable(err.to_string())
    })?;
    Ok(Json(report))
}

/// SMS (`MessageSid`/`MessageStatus`) and voice (`CallSid`/`CallStatus`)
/// status callbacks. Always acknowledged: the provider does not retry them.
pub async fn delivery_status_callback(
    Extension(correlator): Extension<DeliveryCorrelator>,
    Form(fields): Form<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    let message_id = fields
        .get("MessageSid")
        .or_else(|| fields.get("SmsSid"))
        .or_else(|| fields.get("CallSid"));
    let status = fields
        .get("MessageStatus")
        .or_else(|| fields.get("SmsStatus"))
        .or_else(|| fields.get("CallStatus"));
    let (Some(message_id), Some(status)) = (message_id, status) else {
        warn!("delivery callback without message id or status");
        return (StatusCode::OK, "OK");
    };
    let error_code = fields
        .get("ErrorCode")
        .map(|code| code.trim())
        .filter(|code| !code.is_empty());

    let metadata: Map<String, Value> = ["To", "From", "CallDuration", "ErrorMessage", "AnsweredBy"]
        .into_iter()
        .filter_map(|key| {
            fields
                .get(key)
                .map(|value| (key.to_string(), Value::String(value.clone())))
        })
        .collect();
    let metadata = Value::Object(metadata);

    if let Err(err) = correlator
        .on_delivery_callback(message_id, status, error_code, Some(&metadata), Utc::now())
        .await
    {
        error!(?err, provider_message_id = %message_id, "failed to apply delivery callback");
    }
    (StatusCode::OK, "OK")
}

/// Inbound SMS. Replies and opt-outs cancel enrollments; the provider always
/// gets an empty TwiML answer.
pub async fn inbound_sms(
    Extension(enrollments): Extension<EnrollmentService>,
    Form(fields): Form<HashMap<String, String>>,
) -> (StatusCode, [(HeaderName, &'static str); 1], &'static str) {
    let answer = (StatusCode::OK, [(CONTENT_TYPE, "text/xml")], EMPTY_TWIML);
    let (Some(from), Some(body)) = (fields.get("From"), fields.get("Body")) else {
        warn!("inbound sms without sender or body");
        return answer;
    };
    match enrollments
        .stop_for_inbound_message(from.trim(), body, Utc::now())
        .await
    {
        Ok(stopped) if !stopped.is_empty() => {
            info!(stopped = stopped.len(), "inbound sms stopped enrollments");
        }
        Ok(_) => {}
        Err(err) => error!(?err, "failed to apply inbound sms"),
    }
    answer
}

/// Appointment booked for the contact.
pub async fn contact_booked(
    Extension(enrollments): Extension<EnrollmentService>,
    Path(contact_id): Path<Uuid>,
) -> AppResult<Json<Vec<Enrollment>>> {
    let stopped = enrollments
        .stop_for_booking(contact_id, Utc::now())
        .await?;
    Ok(Json(stopped))
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub contact_id: Uuid,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollmentEnvelope {
    pub enrollment: Enrollment,
    pub steps: Vec<EnrollmentStep>,
}

pub async fn enroll_contact(
    Extension(enrollments): Extension<EnrollmentService>,
    Path(sequence_id): Path<Uuid>,
    Json(payload): Json<EnrollRequest>,
) -> AppResult<(StatusCode, Json<Enrollment>)> {
    let enrollment = enrollments
        .enroll(payload.contact_id, sequence_id, payload.metadata, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

pub async fn get_enrollment(
    Extension(enrollments): Extension<EnrollmentService>,
    Path(enrollment_id): Path<Uuid>,
) -> AppResult<Json<EnrollmentEnvelope>> {
    let (enrollment, steps) = enrollments.enrollment_with_steps(enrollment_id).await?;
    Ok(Json(EnrollmentEnvelope { enrollment, steps }))
}

pub async fn stop_enrollment(
    Extension(enrollments): Extension<EnrollmentService>,
    Path(enrollment_id): Path<Uuid>,
    payload: Option<Json<StopRequest>>,
) -> AppResult<Json<Enrollment>> {
    let reason = payload.and_then(|Json(request)| request.reason);
    let enrollment = enrollments
        .stop_enrollment(enrollment_id, reason.as_deref(), Utc::now())
        .await?;
    Ok(Json(enrollment))
}

pub async fn resume_enrollment(
    Extension(enrollments): Extension<EnrollmentService>,
    Path(enrollment_id): Path<Uuid>,
) -> AppResult<Json<Enrollment>> {
    let enrollment = enrollments
        .resume_enrollment(enrollment_id, Utc::now())
        .await?;
    Ok(Json(enrollment))
}
