//! Outbox row storage and the worker-side claim/transition operations.

use super::tasks::{enqueue_intent_internal, OutboxIntent};
use super::{now_ms, Database};
use crate::types::{OutboxRow, OutboxStats, OutboxStatus};
use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

pub fn parse_outbox_row(row: &Row) -> rusqlite::Result<OutboxRow> {
    let payload_json: String = row.get("payload")?;
    let status: String = row.get("status")?;

    Ok(OutboxRow {
        id: row.get("id")?,
        operation: row.get("operation")?,
        backend: row.get("backend")?,
        endpoint: row.get("endpoint")?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        idempotency_key: row.get("idempotency_key")?,
        status: OutboxStatus::from_str(&status).unwrap_or(OutboxStatus::Pending),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        next_retry_at: row.get("next_retry_at")?,
        last_error: row.get("last_error")?,
        lease_expires_at: row.get("lease_expires_at")?,
        task_id: row.get("task_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Database {
    /// Enqueue a standalone intent (scheduler notifications, requeues).
    ///
    /// Returns false when the idempotency key already exists; the insert is
    /// a no-op in that case.
    pub fn enqueue_intent(&self, intent: &OutboxIntent, task_id: Option<&str>) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| enqueue_intent_internal(conn, intent, task_id, now))
    }

    /// Claim a batch of ready rows for dispatch.
    ///
    /// Selects up to `limit` rows that are pending and due, ordered by
    /// `next_retry_at` (nulls first) then id, and flips them to inflight with
    /// a lease inside one transaction. Because the claim is a single
    /// exclusive transaction, a row can never be handed to two workers.
    pub fn claim_outbox_batch(
        &self,
        limit: usize,
        now: i64,
        lease_ms: i64,
    ) -> Result<Vec<OutboxRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut rows = {
                let mut stmt = tx.prepare(
                    "SELECT * FROM outbox
                     WHERE status = 'pending'
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                     ORDER BY next_retry_at IS NOT NULL, next_retry_at, id
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![now, limit as i64], parse_outbox_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            for row in &mut rows {
                tx.execute(
                    "UPDATE outbox SET status = 'inflight', lease_expires_at = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![now + lease_ms, now, row.id],
                )?;
                row.status = OutboxStatus::Inflight;
                row.lease_expires_at = Some(now + lease_ms);
            }

            tx.commit()?;
            Ok(rows)
        })
    }

    /// Mark a row delivered (terminal).
    pub fn mark_delivered(&self, row_id: i64) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = 'delivered', lease_expires_at = NULL,
                    last_error = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, row_id],
            )?;
            Ok(())
        })
    }

    /// Re-queue a row for another attempt after a retryable failure.
    pub fn mark_retry(
        &self,
        row_id: i64,
        retry_count: i32,
        next_retry_at: i64,
        error: &str,
    ) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = 'pending', retry_count = ?1,
                    next_retry_at = ?2, last_error = ?3, lease_expires_at = NULL,
                    updated_at = ?4
                 WHERE id = ?5",
                params![retry_count, next_retry_at, error, now, row_id],
            )?;
            Ok(())
        })
    }

    /// Move a row to the dead letter state (terminal; requires explicit requeue).
    pub fn mark_dead_letter(&self, row_id: i64, error: &str) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET status = 'dead_letter', last_error = ?1,
                    next_retry_at = NULL, lease_expires_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![error, now, row_id],
            )?;
            Ok(())
        })
    }

    /// Reclaim inflight rows whose lease has expired.
    ///
    /// Run at startup and periodically: a worker that crashed mid-flight
    /// leaves its rows inflight, and the idempotency key makes the retry safe.
    pub fn reclaim_expired_leases(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let reclaimed = conn.execute(
                "UPDATE outbox SET status = 'pending', lease_expires_at = NULL, updated_at = ?1
                 WHERE status = 'inflight' AND lease_expires_at IS NOT NULL
                   AND lease_expires_at <= ?1",
                params![now],
            )?;
            Ok(reclaimed)
        })
    }

    /// Requeue a dead-lettered row (operator action).
    pub fn requeue_dead_letter(&self, row_id: i64) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE outbox SET status = 'pending', retry_count = 0,
                    next_retry_at = NULL, last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'dead_letter'",
                params![now, row_id],
            )?;

            if updated == 0 {
                return Err(anyhow!("Outbox row {} is not in dead_letter", row_id));
            }
            Ok(())
        })
    }

    /// Get one outbox row by id.
    pub fn get_outbox_row(&self, row_id: i64) -> Result<Option<OutboxRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM outbox WHERE id = ?1")?;
            match stmt.query_row(params![row_id], parse_outbox_row) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Look up an outbox row by idempotency key.
    pub fn get_outbox_row_by_key(&self, key: &str) -> Result<Option<OutboxRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM outbox WHERE idempotency_key = ?1")?;
            match stmt.query_row(params![key], parse_outbox_row) {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Drop delivered rows older than the cutoff. Terminal dead-letter rows
    /// are kept; they need operator review.
    pub fn prune_delivered(&self, cutoff: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let pruned = conn.execute(
                "DELETE FROM outbox WHERE status = 'delivered' AND updated_at < ?1",
                params![cutoff],
            )?;
            Ok(pruned)
        })
    }

    /// Counts per status for the operator surface.
    pub fn outbox_stats(&self) -> Result<OutboxStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
            let mut stats = OutboxStats::new();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                stats.insert(status, count);
            }
            Ok(stats)
        })
    }
}
