//! Advisory job locks for scheduler overlap prevention.

use super::{now_ms, Database};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Try to take the advisory lock for a named job.
    ///
    /// Returns true when acquired. A lock whose TTL has lapsed can be taken
    /// over, so a crashed holder never wedges the job permanently.
    pub fn try_acquire_job_lock(&self, job_name: &str, holder: &str, ttl_ms: i64) -> Result<bool> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT holder, expires_at FROM job_locks WHERE job_name = ?1",
                    params![job_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();

            let acquired = match existing {
                Some((_, expires_at)) if expires_at > now => false,
                Some(_) => {
                    tx.execute(
                        "UPDATE job_locks SET holder = ?1, acquired_at = ?2, expires_at = ?3
                         WHERE job_name = ?4",
                        params![holder, now, now + ttl_ms, job_name],
                    )?;
                    true
                }
                None => {
                    tx.execute(
                        "INSERT INTO job_locks (job_name, holder, acquired_at, expires_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![job_name, holder, now, now + ttl_ms],
                    )?;
                    true
                }
            };

            tx.commit()?;
            Ok(acquired)
        })
    }

    /// Release a job lock held by `holder`.
    pub fn release_job_lock(&self, job_name: &str, holder: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM job_locks WHERE job_name = ?1 AND holder = ?2",
                params![job_name, holder],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Drop every advisory lock. Called when a process opens the store:
    /// whatever held a lock before the restart no longer exists.
    pub(crate) fn clear_job_locks(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let cleared = conn.execute("DELETE FROM job_locks", [])?;
            Ok(cleared)
        })
    }
}
