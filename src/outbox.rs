//! Outbox delivery engine: claims ready rows, dispatches them through the
//! backend capability interface, and drives the retry / dead-letter state
//! machine.

use crate::backends::{BackendRegistry, DispatchOutcome};
use crate::config::OutboxConfig;
use crate::db::{now_ms, Database};
use crate::types::{OutboxRow, OutboxStatus};
use anyhow::Result;
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Canonical JSON: object keys sorted recursively, no whitespace.
///
/// The producer-side idempotency key hashes this form, so two payloads that
/// differ only in key order produce the same key.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }

    canonicalize(value).to_string()
}

/// Content hash identifying a unique intended side effect:
/// `sha256(backend | operation | endpoint | canonical(payload))`.
pub fn idempotency_key(
    backend: &str,
    operation: &str,
    endpoint: &str,
    payload: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend.as_bytes());
    hasher.update(b"|");
    hasher.update(operation.as_bytes());
    hasher.update(b"|");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotency key for a stale-task nudge: one notification per task per
/// UTC day.
pub fn nudge_key(task_id: &str, day: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"notify|");
    hasher.update(task_id.as_bytes());
    hasher.update(b"|");
    hasher.update(day.as_bytes());
    hex::encode(hasher.finalize())
}

/// Summary of one worker tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// One outbox worker. Several run in parallel; the claim transaction keeps
/// them from ever holding the same row.
pub struct OutboxWorker {
    db: Database,
    registry: Arc<BackendRegistry>,
    config: OutboxConfig,
}

impl OutboxWorker {
    pub fn new(db: Database, registry: Arc<BackendRegistry>, config: OutboxConfig) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    /// Claim and dispatch one batch. Per-row state transitions commit
    /// individually so a poisoning row cannot block the rest of the batch.
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = now_ms();
        let lease_ms = self.config.inflight_lease_seconds as i64 * 1000;
        let batch = self
            .db
            .claim_outbox_batch(self.config.batch_size, now, lease_ms)?;

        let mut summary = TickSummary {
            claimed: batch.len(),
            ..Default::default()
        };

        for row in batch {
            match self.dispatch_row(&row).await {
                RowResult::Delivered => summary.delivered += 1,
                RowResult::Retried => summary.retried += 1,
                RowResult::DeadLettered => summary.dead_lettered += 1,
            }
        }

        Ok(summary)
    }

    async fn dispatch_row(&self, row: &OutboxRow) -> RowResult {
        let Some(backend) = self.registry.get(&row.backend) else {
            // Unknown backend cannot succeed on retry.
            let _ = self
                .db
                .mark_dead_letter(row.id, &format!("unknown backend: {}", row.backend));
            return RowResult::DeadLettered;
        };

        if let Some(limiter) = self.registry.limiter(&row.backend) {
            limiter.acquire().await;
        }

        let outcome = backend.dispatch(row).await;
        self.apply_outcome(row, outcome)
    }

    fn apply_outcome(&self, row: &OutboxRow, outcome: DispatchOutcome) -> RowResult {
        match outcome {
            DispatchOutcome::Success { external_id } => {
                if let Err(e) = self.db.mark_delivered(row.id) {
                    warn!(row = row.id, "failed to mark delivered: {}", e);
                }
                if let (Some(external_id), Some(task_id)) = (external_id, row.task_id.as_deref()) {
                    if row.operation == crate::types::OP_CREATE_TASK {
                        if let Err(e) = self.db.upsert_mapping(&row.backend, &external_id, task_id)
                        {
                            warn!(row = row.id, "failed to record mapping: {}", e);
                        }
                    }
                }
                debug!(row = row.id, backend = %row.backend, op = %row.operation, "delivered");
                RowResult::Delivered
            }
            DispatchOutcome::Permanent { status, message } => {
                let error = format!("permanent failure ({}): {}", status, message);
                let _ = self.db.mark_dead_letter(row.id, &error);
                let _ = self.db.log_audit_event(
                    "outbox_dead_letter",
                    row.task_id.as_deref(),
                    Some(&row.backend),
                    Some(&json!({ "row_id": row.id, "error": error })),
                    None,
                );
                warn!(row = row.id, backend = %row.backend, "dead-lettered: {}", error);
                RowResult::DeadLettered
            }
            DispatchOutcome::Retryable {
                status,
                retry_after,
                message,
            } => {
                let next_count = row.retry_count + 1;
                let error = match status {
                    Some(status) => format!("retryable failure ({}): {}", status, message),
                    None => format!("retryable failure: {}", message),
                };

                if next_count >= row.max_retries {
                    let error = format!("{} (retries exhausted)", error);
                    let _ = self.db.mark_dead_letter(row.id, &error);
                    let _ = self.db.log_audit_event(
                        "outbox_dead_letter",
                        row.task_id.as_deref(),
                        Some(&row.backend),
                        Some(&json!({ "row_id": row.id, "error": error })),
                        None,
                    );
                    warn!(row = row.id, backend = %row.backend, "dead-lettered: {}", error);
                    RowResult::DeadLettered
                } else {
                    let delay_ms = self.backoff_ms(next_count, retry_after);
                    let _ = self
                        .db
                        .mark_retry(row.id, next_count, now_ms() + delay_ms, &error);
                    debug!(
                        row = row.id,
                        attempt = next_count,
                        delay_ms, "scheduled retry: {}", error
                    );
                    RowResult::Retried
                }
            }
        }
    }

    /// Exponential backoff with jitter: `min(cap, base · 2^n) · (1 ± jitter)`.
    /// A Retry-After hint from the backend overrides the computed delay.
    fn backoff_ms(&self, attempt: i32, retry_after: Option<u64>) -> i64 {
        if let Some(seconds) = retry_after {
            return (seconds * 1000) as i64;
        }

        let base = self.config.backoff_base_ms as f64;
        let cap = self.config.backoff_cap_ms as f64;
        let raw = (base * 2f64.powi(attempt - 1)).min(cap);

        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        (raw * factor).max(0.0) as i64
    }
}

enum RowResult {
    Delivered,
    Retried,
    DeadLettered,
}

/// Reclaim expired inflight leases; run at startup and between ticks.
pub fn reclaim_leases(db: &Database) -> Result<usize> {
    let reclaimed = db.reclaim_expired_leases(now_ms())?;
    if reclaimed > 0 {
        info!("reclaimed {} expired outbox leases", reclaimed);
        let _ = db.log_audit_event(
            "outbox_lease_reclaimed",
            None,
            None,
            Some(&json!({ "count": reclaimed })),
            None,
        );
    }
    Ok(reclaimed)
}

/// Count of rows that are ready or will become ready (diagnostics).
pub fn pending_count(db: &Database) -> Result<i64> {
    let stats = db.outbox_stats()?;
    Ok(*stats.get(OutboxStatus::Pending.as_str()).unwrap_or(&0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"z":2,"y":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"y":3,"z":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn key_is_stable_and_input_sensitive() {
        let payload = json!({ "title": "t", "client": "acme" });
        let k1 = idempotency_key("backend_a", "create_task", "/tasks", &payload);
        let k2 = idempotency_key("backend_a", "create_task", "/tasks", &payload);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);

        let k3 = idempotency_key("backend_b", "create_task", "/tasks", &payload);
        assert_ne!(k1, k3);

        let other = json!({ "title": "t2", "client": "acme" });
        let k4 = idempotency_key("backend_a", "create_task", "/tasks", &other);
        assert_ne!(k1, k4);
    }

    #[test]
    fn nudge_key_is_per_task_per_day() {
        let a = nudge_key("tsk_1", "2024-05-01");
        let b = nudge_key("tsk_1", "2024-05-02");
        let c = nudge_key("tsk_2", "2024-05-01");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, nudge_key("tsk_1", "2024-05-01"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let db = Database::open_in_memory().unwrap();
        let worker = OutboxWorker::new(
            db,
            Arc::new(BackendRegistry::new()),
            OutboxConfig {
                jitter: 0.0,
                ..Default::default()
            },
        );

        assert_eq!(worker.backoff_ms(1, None), 1_000);
        assert_eq!(worker.backoff_ms(2, None), 2_000);
        assert_eq!(worker.backoff_ms(3, None), 4_000);
        assert_eq!(worker.backoff_ms(10, None), 60_000);
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let db = Database::open_in_memory().unwrap();
        let worker = OutboxWorker::new(
            db,
            Arc::new(BackendRegistry::new()),
            OutboxConfig::default(),
        );

        for _ in 0..50 {
            let delay = worker.backoff_ms(1, None);
            assert!((800..=1_200).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let db = Database::open_in_memory().unwrap();
        let worker = OutboxWorker::new(
            db,
            Arc::new(BackendRegistry::new()),
            OutboxConfig::default(),
        );

        assert_eq!(worker.backoff_ms(1, Some(17)), 17_000);
    }
}
