//! External-id mapping between backends and internal tasks.

use super::{now_ms, Database};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Record the `(backend, external_id) → task_id` binding.
    ///
    /// At most one binding exists per (backend, external_id); re-recording
    /// the same pair is a no-op.
    pub fn upsert_mapping(&self, backend: &str, external_id: &str, task_id: &str) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO task_mapping (backend, external_id, task_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![backend, external_id, task_id, now],
            )?;
            Ok(())
        })
    }

    /// Resolve a backend's external id to the internal task id.
    pub fn get_internal_id(&self, backend: &str, external_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT task_id FROM task_mapping WHERE backend = ?1 AND external_id = ?2",
                params![backend, external_id],
                |row| row.get::<_, String>(0),
            );

            match result {
                Ok(task_id) => Ok(Some(task_id)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// All `(backend, external_id)` bindings held by a task.
    pub fn get_mappings_for_task(&self, task_id: &str) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT backend, external_id FROM task_mapping WHERE task_id = ?1
                 ORDER BY backend",
            )?;
            let rows = stmt
                .query_map(params![task_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of bindings for a task on one backend (diagnostics, tests).
    pub fn mapping_count(&self, backend: &str, task_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_mapping WHERE backend = ?1 AND task_id = ?2",
                params![backend, task_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
