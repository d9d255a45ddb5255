//! Seen-delivery ledger for webhook replay protection.

use super::{now_ms, Database};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Atomic check-and-insert for a webhook delivery.
    ///
    /// Returns true when the delivery is fresh; a duplicate delivery id is a
    /// no-op and returns false. The primary-key insert serializes the
    /// decision.
    pub fn record_delivery(
        &self,
        delivery_id: &str,
        backend: &str,
        payload_hash: &str,
    ) -> Result<bool> {
        let now = now_ms();

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO deliveries (delivery_id, backend, payload_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![delivery_id, backend, payload_hash, now],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Prune ledger entries older than the retention cutoff.
    pub fn prune_deliveries(&self, cutoff: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let pruned = conn.execute(
                "DELETE FROM deliveries WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(pruned)
        })
    }

    /// Total ledger size (diagnostics).
    pub fn delivery_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM deliveries", [], |row| {
                row.get(0)
            })?;
            Ok(count)
        })
    }
}
