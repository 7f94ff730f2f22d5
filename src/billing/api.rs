use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BillingSettings;
use crate::error::{AppError, AppResult};

use super::entitlements::{AccessDecision, EntitlementEvaluator, UsageSummary};
use super::ledger::PeriodKey;
use super::models::{GracePeriodInfo, ScheduledDowngradeInfo};
use super::plans::FeatureType;
use super::webhook::{parse_event, verify_signature};
use super::BillingError;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
pub struct AccessRequest {
    pub feature: FeatureType,
}

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    pub feature: FeatureType,
    #[serde(default)]
    pub quantity: Option<u32>,
}

/// key: entitlements-api -> rest endpoints
pub async fn check_access(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<AccessRequest>,
) -> Json<AccessDecision> {
    Json(evaluator.check_access(user_id, payload.feature).await)
}

pub async fn require_access(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<AccessRequest>,
) -> AppResult<Json<AccessDecision>> {
    let decision = evaluator.require_access(user_id, payload.feature).await?;
    Ok(Json(decision))
}

pub async fn record_usage(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<RecordUsageRequest>,
) -> AppResult<StatusCode> {
    let quantity = payload.quantity.unwrap_or(1);
    if evaluator.record(user_id, payload.feature, quantity) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::Unavailable("usage queue saturated".into()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    /// `YYYY-MM`; defaults to the current month.
    pub period: Option<String>,
}

pub async fn get_usage_summary(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<UsageQuery>,
) -> AppResult<Json<UsageSummary>> {
    let now = Utc::now();
    let summary = match query.period.as_deref() {
        Some(raw) => {
            let period_key = PeriodKey::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("invalid period `{raw}`")))?;
            evaluator
                .usage_summary_for_period(user_id, period_key, now)
                .await?
        }
        None => evaluator.usage_summary(user_id, now).await?,
    };
    Ok(Json(summary))
}

pub async fn get_grace_period(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<GracePeriodInfo>> {
    let info = evaluator
        .subscriptions()
        .grace_period_info(user_id, Utc::now())
        .await?;
    Ok(Json(info))
}

pub async fn get_scheduled_downgrade(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Option<ScheduledDowngradeInfo>>> {
    let info = evaluator
        .subscriptions()
        .scheduled_downgrade_info(user_id, Utc::now())
        .await?;
    Ok(Json(info))
}

/// Billing provider webhook. Anything that is not a signature or store failure
/// is acknowledged so the provider does not redeliver it forever.
pub async fn receive_webhook(
    Extension(evaluator): Extension<EntitlementEvaluator>,
    Extension(settings): Extension<Arc<BillingSettings>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let Some(secret) = settings.webhook_secret.as_deref() else {
        error!("billing webhook received but no webhook secret is configured");
        return Err(AppError::Unavailable("billing webhook not configured".into()));
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    verify_signature(
        secret,
        signature,
        &body,
        Utc::now(),
        settings.webhook_tolerance_secs,
    )
    .map_err(|err| {
        warn!(?err, "billing webhook signature rejected");
        AppError::Unauthorized
    })?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid JSON: {err}")))?;
    let Some(event) = parse_event(&payload, &settings.price_plan_map)
        .map_err(|err| AppError::BadRequest(err.to_string()))?
    else {
        let event_type = payload
            .get("type")
            .and_then(|value| value.as_str())
            .unwrap_or("unknown");
        info!(event_type, "ignoring billing webhook event");
        return Ok(Json(json!({ "received": true, "applied": false })));
    };

    match evaluator.subscriptions().apply_billing_event(&event).await {
        Ok(_) => Ok(Json(json!({ "received": true, "applied": true }))),
        Err(BillingError::Store(err)) => Err(AppError::Store(err)),
        Err(BillingError::ConcurrentUpdate(id)) => Err(AppError::Unavailable(format!(
            "subscription `{id}` is being updated concurrently"
        ))),
        Err(err) => {
            warn!(
                ?err,
                event = event.kind.as_str(),
                external_subscription_id = %event.external_subscription_id,
                "billing webhook event acknowledged without applying"
            );
            Ok(Json(json!({ "received": true, "applied": false })))
        }
    }
}
