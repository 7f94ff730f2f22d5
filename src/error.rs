use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::{AccessDenial, AccessError};
use crate::db::StoreError;
use crate::sequences::EnrollmentError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{} limit reached", .0.feature)]
    PaymentRequired(AccessDenial),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied(denial) => AppError::PaymentRequired(denial),
            AccessError::Unavailable(reason) => AppError::Unavailable(reason),
        }
    }
}

impl From<EnrollmentError> for AppError {
    fn from(err: EnrollmentError) -> Self {
        match err {
            EnrollmentError::Store(err) => AppError::Store(err),
            EnrollmentError::SequenceNotFound(_)
            | EnrollmentError::ContactNotFound(_)
            | EnrollmentError::EnrollmentNotFound(_) => AppError::NotFound,
            EnrollmentError::AlreadyEnrolled => AppError::Conflict(err.to_string()),
            EnrollmentError::SequenceInactive(_)
            | EnrollmentError::NoSteps(_)
            | EnrollmentError::InvalidState(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::PaymentRequired(denial) = &self {
            tracing::info!(feature = %denial.feature, plan = denial.plan.as_str(), "responding with payment required");
            let body = json!({
                "error": "limit_reached",
                "feature": denial.feature,
                "plan": denial.plan,
                "limit": denial.limit,
                "current_usage": denial.current_usage,
                "upgrade_required": denial.upgrade_required,
                "suggested_plan": denial.suggested_plan,
            });
            return (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
        }

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Store(StoreError::Corrupt { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Store(_) | AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
