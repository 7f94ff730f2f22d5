use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use super::models::{BillingEvent, BillingEventKind, PlanType};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("invalid webhook payload: {0}")]
    Payload(String),
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::MalformedSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `t=<unix>,v1=<hex>[,v1=<hex>...]` header.
pub fn verify_signature(
    secret: &str,
    header: Option<&str>,
    payload: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| WebhookError::MalformedSignature)?,
                )
            }
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
    if candidates.is_empty() {
        return Err(WebhookError::MalformedSignature);
    }
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(WebhookError::StaleTimestamp);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookError::MalformedSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(WebhookError::SignatureMismatch)
}

/// Converts a provider event into a `BillingEvent`. Event types that do not
/// affect subscriptions yield `Ok(None)`.
pub fn parse_event(
    payload: &Value,
    price_plan_map: &HashMap<String, String>,
) -> Result<Option<BillingEvent>, WebhookError> {
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::Payload("missing event type".into()))?;
    let object = payload
        .pointer("/data/object")
        .ok_or_else(|| WebhookError::Payload("missing data.object".into()))?;
    let occurred_at = payload
        .get("created")
        .and_then(Value::as_i64)
        .and_then(unix)
        .unwrap_or_else(Utc::now);

    match event_type {
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            let kind = match event_type {
                "customer.subscription.created" => BillingEventKind::SubscriptionCreated,
                "customer.subscription.updated" => BillingEventKind::SubscriptionUpdated,
                _ => BillingEventKind::SubscriptionDeleted,
            };
            let external_subscription_id = string_field(object, "id")
                .ok_or_else(|| WebhookError::Payload("subscription without id".into()))?;
            let status = if kind == BillingEventKind::SubscriptionDeleted {
                "canceled".to_string()
            } else {
                string_field(object, "status")
                    .ok_or_else(|| WebhookError::Payload("subscription without status".into()))?
            };
            Ok(Some(BillingEvent {
                kind,
                external_subscription_id,
                user_id: metadata_user_id(object.get("metadata")),
                customer_id: string_field(object, "customer"),
                status,
                plan_type: subscription_plan(object, price_plan_map),
                current_period_start: object
                    .get("current_period_start")
                    .and_then(Value::as_i64)
                    .and_then(unix),
                current_period_end: object
                    .get("current_period_end")
                    .and_then(Value::as_i64)
                    .and_then(unix),
                cancel_at_period_end: object.get("cancel_at_period_end").and_then(Value::as_bool),
                occurred_at,
            }))
        }
        "invoice.payment_failed" | "invoice.payment_succeeded" => {
            // One-off invoices carry no subscription.
            let Some(external_subscription_id) = string_field(object, "subscription") else {
                return Ok(None);
            };
            let (kind, status) = if event_type == "invoice.payment_failed" {
                (BillingEventKind::PaymentFailed, "past_due")
            } else {
                (BillingEventKind::PaymentSucceeded, "active")
            };
            Ok(Some(BillingEvent {
                kind,
                external_subscription_id,
                user_id: metadata_user_id(object.pointer("/subscription_details/metadata"))
                    .or_else(|| metadata_user_id(object.get("metadata"))),
                customer_id: string_field(object, "customer"),
                status: status.to_string(),
                plan_type: None,
                current_period_start: None,
                current_period_end: None,
                cancel_at_period_end: None,
                occurred_at,
            }))
        }
        _ => Ok(None),
    }
}

fn unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn string_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn metadata_user_id(metadata: Option<&Value>) -> Option<Uuid> {
    metadata
        .and_then(|metadata| metadata.get("user_id"))
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

fn subscription_plan(object: &Value, price_plan_map: &HashMap<String, String>) -> Option<PlanType> {
    let from_price = object
        .pointer("/items/data/0/price/id")
        .and_then(Value::as_str)
        .and_then(|price_id| price_plan_map.get(price_id))
        .map(|plan| PlanType::normalize(plan));
    from_price.or_else(|| {
        object
            .pointer("/metadata/plan_type")
            .and_then(Value::as_str)
            .map(PlanType::normalize)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    #[test]
    fn accepts_valid_signature() {
        let now = Utc::now();
        let body = br#"{"type":"ping"}"#;
        let signature = sign(SECRET, now.timestamp(), body).unwrap();
        let header = format!("t={},v1={}", now.timestamp(), signature);
        assert_eq!(
            verify_signature(SECRET, Some(&header), body, now, 300),
            Ok(())
        );
    }

    #[test]
    fn rejects_tampered_and_stale_signatures() {
        let now = Utc::now();
        let body = br#"{"type":"ping"}"#;
        let signature = sign(SECRET, now.timestamp(), body).unwrap();

        let header = format!("t={},v1={}", now.timestamp(), signature);
        assert_eq!(
            verify_signature(SECRET, Some(&header), br#"{"type":"pong"}"#, now, 300),
            Err(WebhookError::SignatureMismatch)
        );

        let old = now.timestamp() - 3_600;
        let stale = format!("t={},v1={}", old, sign(SECRET, old, body).unwrap());
        assert_eq!(
            verify_signature(SECRET, Some(&stale), body, now, 300),
            Err(WebhookError::StaleTimestamp)
        );

        assert_eq!(
            verify_signature(SECRET, None, body, now, 300),
            Err(WebhookError::MissingSignature)
        );
        assert_eq!(
            verify_signature(SECRET, Some("v1=abc"), body, now, 300),
            Err(WebhookError::MalformedSignature)
        );
    }

    #[test]
    fn subscription_update_maps_price_to_plan() {
        let user_id = Uuid::new_v4();
        let payload = json!({
            "type": "customer.subscription.updated",
            "created": 1_714_564_800,
            "data": {"object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "past_due",
                "cancel_at_period_end": true,
                "current_period_start": 1_714_564_800,
                "current_period_end": 1_717_243_200,
                "metadata": {"user_id": user_id.to_string()},
                "items": {"data": [{"price": {"id": "price_biz"}}]}
            }}
        });
        let prices = HashMap::from([("price_biz".to_string(), "business_annual".to_string())]);

        let event = parse_event(&payload, &prices).unwrap().unwrap();
        assert_eq!(event.kind, BillingEventKind::SubscriptionUpdated);
        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.plan_type, Some(PlanType::Business));
        assert_eq!(event.status, "past_due");
        assert_eq!(event.cancel_at_period_end, Some(true));
        assert_eq!(
            event.current_period_end,
            Utc.timestamp_opt(1_717_243_200, 0).single()
        );
    }

    #[test]
    fn metadata_plan_is_fallback() {
        let payload = json!({
            "type": "customer.subscription.created",
            "data": {"object": {
                "id": "sub_2",
                "status": "trialing",
                "metadata": {"plan_type": "premium_monthly"}
            }}
        });
        let event = parse_event(&payload, &HashMap::new()).unwrap().unwrap();
        assert_eq!(event.plan_type, Some(PlanType::Premium));
    }

    #[test]
    fn invoice_events_target_subscription() {
        let payload = json!({
            "type": "invoice.payment_failed",
            "data": {"object": {"subscription": "sub_3", "customer": "cus_3"}}
        });
        let event = parse_event(&payload, &HashMap::new()).unwrap().unwrap();
        assert_eq!(event.kind, BillingEventKind::PaymentFailed);
        assert_eq!(event.external_subscription_id, "sub_3");

        let one_off = json!({
            "type": "invoice.payment_succeeded",
            "data": {"object": {"subscription": null}}
        });
        assert!(parse_event(&one_off, &HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let payload = json!({"type": "charge.refunded", "data": {"object": {}}});
        assert!(parse_event(&payload, &HashMap::new()).unwrap().is_none());
        assert!(parse_event(&json!({"data": {}}), &HashMap::new()).is_err());
    }
}
