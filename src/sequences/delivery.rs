use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::StoreError;

use super::models::DeliveryStatus;
use super::store::SequenceStore;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied,
    /// Same status and error code as already stored.
    Duplicate,
    /// Older than the stored status; ignored.
    Stale,
    UnknownMessage,
    UnrecognizedStatus,
}

/// key: delivery-correlator -> async provider callbacks onto delivery records
#[derive(Clone)]
pub struct DeliveryCorrelator {
    store: Arc<dyn SequenceStore>,
}

impl DeliveryCorrelator {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self { store }
    }

    pub async fn on_delivery_callback(
        &self,
        provider_message_id: &str,
        raw_status: &str,
        error_code: Option<&str>,
        metadata: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<CallbackOutcome, StoreError> {
        let Some(status) = DeliveryStatus::from_provider(raw_status) else {
            warn!(%provider_message_id, raw_status, "unrecognised delivery status; ignoring callback");
            return Ok(CallbackOutcome::UnrecognizedStatus);
        };

        let Some(record) = self.store.delivery_record(provider_message_id).await? else {
            info!(%provider_message_id, status = status.as_str(), "callback for unknown message; discarding");
            return Ok(CallbackOutcome::UnknownMessage);
        };

        if record.delivery_status == status
            && (error_code.is_none() || record.error_code.as_deref() == error_code)
        {
            debug!(%provider_message_id, status = status.as_str(), "duplicate delivery callback");
            return Ok(CallbackOutcome::Duplicate);
        }
        if !record.delivery_status.can_supersede(status) {
            debug!(
                %provider_message_id,
                current = record.delivery_status.as_str(),
                incoming = status.as_str(),
                "stale delivery callback ignored"
            );
            return Ok(CallbackOutcome::Stale);
        }

        let allowed_from = DeliveryStatus::predecessors(status);
        let Some(updated) = self
            .store
            .update_delivery_status(
                provider_message_id,
                status,
                error_code,
                metadata,
                &allowed_from,
                now,
            )
            .await?
        else {
            return Ok(CallbackOutcome::Stale);
        };
        info!(
            %provider_message_id,
            status = status.as_str(),
            error_code = error_code.unwrap_or(""),
            "delivery status updated"
        );

        if status.is_permanent_failure() {
            if let Some(step_id) = updated.enrollment_step_id {
                let reason = format!(
                    "delivery {}: {}",
                    status.as_str(),
                    error_code.unwrap_or("no error code")
                );
                if self
                    .store
                    .fail_delivered_step(
                        step_id,
                        provider_message_id,
                        updated.claim_token,
                        &reason,
                        now,
                    )
                    .await?
                {
                    warn!(%provider_message_id, %step_id, %reason, "step marked failed after delivery failure");
                }
            }
        }
        Ok(CallbackOutcome::Applied)
    }
}
