//! Webhook intake: signature verification, replay deduplication, and
//! application of backend change events.

use crate::backends::Backend;
use crate::db::{now_ms, Database};
use crate::error::{AppError, AppResult};
use crate::types::{BackendEvent, TaskStatus};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// How an accepted delivery was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Fresh delivery, state updated.
    Applied,
    /// Fresh delivery for an external id with no mapping; recorded only.
    Unmapped,
    /// Replay of a seen delivery id; no state change.
    Duplicate,
}

/// Handle one inbound webhook delivery.
///
/// Rejected signatures change no state and are logged with the delivery id
/// hash only; duplicates are success no-ops.
pub fn handle_delivery(
    db: &Database,
    backend: &dyn Backend,
    raw_body: &[u8],
    provided_signature: &str,
) -> AppResult<WebhookDisposition> {
    if !backend.verify_webhook(raw_body, provided_signature) {
        let body_hash = hex::encode(Sha256::digest(raw_body));
        debug!(
            backend = backend.name(),
            body_hash = %&body_hash[..16],
            "webhook signature rejected"
        );
        return Err(AppError::signature_failure(backend.name()));
    }

    let event = parse_event(raw_body)?;
    let payload_hash = hex::encode(Sha256::digest(raw_body));

    let fresh = db
        .record_delivery(&event.delivery_id, backend.name(), &payload_hash)
        .map_err(AppError::from)?;
    if !fresh {
        debug!(
            backend = backend.name(),
            delivery = %hash_prefix(&event.delivery_id),
            "duplicate delivery ignored"
        );
        return Ok(WebhookDisposition::Duplicate);
    }

    apply_event(db, backend.name(), &event)
}

/// Reduce a raw webhook body to the fields the core acts on.
///
/// Delivery id falls back to the body hash so byte-identical replays without
/// an id still dedup.
pub fn parse_event(raw_body: &[u8]) -> AppResult<BackendEvent> {
    let value: Value = serde_json::from_slice(raw_body)
        .map_err(|_| AppError::invalid_value("body", "webhook body must be JSON"))?;

    let delivery_id = ["delivery_id", "event_id", "id"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| hex::encode(Sha256::digest(raw_body)));

    let external_id = value
        .get("task_id")
        .cloned()
        .or_else(|| value.get("task").and_then(|t| t.get("id")).cloned())
        .and_then(|id| match id {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    let status = value
        .get("status")
        .or_else(|| value.get("task").and_then(|t| t.get("status")))
        .and_then(Value::as_str)
        .and_then(TaskStatus::from_str);

    let event_timestamp = value
        .get("timestamp")
        .or_else(|| value.get("date"))
        .and_then(Value::as_i64);

    Ok(BackendEvent {
        delivery_id,
        external_id,
        status,
        event_timestamp,
    })
}

fn apply_event(db: &Database, backend: &str, event: &BackendEvent) -> AppResult<WebhookDisposition> {
    let Some(external_id) = event.external_id.as_deref() else {
        db.log_audit_event(
            "webhook_received",
            None,
            Some(backend),
            Some(&json!({ "delivery": hash_prefix(&event.delivery_id) })),
            None,
        )
        .map_err(AppError::from)?;
        return Ok(WebhookDisposition::Unmapped);
    };

    let Some(task_id) = db
        .get_internal_id(backend, external_id)
        .map_err(AppError::from)?
    else {
        db.log_audit_event(
            "webhook_unmapped",
            None,
            Some(backend),
            Some(&json!({ "delivery": hash_prefix(&event.delivery_id) })),
            None,
        )
        .map_err(AppError::from)?;
        return Ok(WebhookDisposition::Unmapped);
    };

    let activity_at = event.event_timestamp.unwrap_or_else(now_ms);
    db.touch_activity(&task_id, activity_at)
        .map_err(AppError::from)?;

    if let Some(status) = event.status {
        // Regressions only apply when the event is newer than our state;
        // out-of-order events are ignored, not errors.
        let changed = db
            .set_status(&task_id, status, event.event_timestamp)
            .map_err(AppError::from)?;
        if changed {
            info!(task = %task_id, status = status.as_str(), "webhook status applied");
        }
    }

    db.log_audit_event(
        "webhook_applied",
        Some(&task_id),
        Some(backend),
        Some(&json!({ "delivery": hash_prefix(&event.delivery_id) })),
        None,
    )
    .map_err(AppError::from)?;

    Ok(WebhookDisposition::Applied)
}

/// Only a hash prefix of the delivery id ever reaches the logs.
fn hash_prefix(delivery_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(delivery_id.as_bytes()));
    digest[..16].to_string()
}
