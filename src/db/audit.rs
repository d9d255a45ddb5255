//! Append-only audit log, decision traces, and persisted plans.

use super::{now_ms, Database};
use crate::types::{DecisionTrace, PlanEntry};
use anyhow::Result;
use rusqlite::params;

impl Database {
    /// Append an audit event.
    pub fn log_audit_event(
        &self,
        event_type: &str,
        task_id: Option<&str>,
        backend: Option<&str>,
        data: Option<&serde_json::Value>,
        request_id: Option<&str>,
    ) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_events (event_type, task_id, backend, data, request_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_type,
                    task_id,
                    backend,
                    data.map(|d| d.to_string()),
                    request_id,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Persist a rebalance result: ordered plan entries plus decision traces.
    pub fn save_plan(
        &self,
        session_id: &str,
        entries: &[PlanEntry],
        traces: &[DecisionTrace],
    ) -> Result<()> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for entry in entries {
                tx.execute(
                    "INSERT INTO plans (session_id, position, task_id, client, effort_hours,
                        adjusted_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        session_id,
                        entry.position,
                        entry.task_id,
                        entry.client,
                        entry.effort_hours,
                        entry.adjusted_score,
                        now,
                    ],
                )?;
            }

            for trace in traces {
                tx.execute(
                    "INSERT INTO decision_traces (session_id, task_id, over_task_id,
                        delta_urgency, delta_sla, delta_staleness, delta_fairness, delta_total,
                        rank_old, rank_new, rationale, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        session_id,
                        trace.task_id,
                        trace.over_task_id,
                        trace.delta_urgency,
                        trace.delta_sla,
                        trace.delta_staleness,
                        trace.delta_fairness,
                        trace.delta_total,
                        trace.rank_old,
                        trace.rank_new,
                        trace.rationale,
                        now,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Ordered task ids of the most recently persisted plan, if any.
    pub fn latest_plan_order(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let session: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM plans ORDER BY created_at DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();

            let Some(session) = session else {
                return Ok(Vec::new());
            };

            let mut stmt = conn.prepare(
                "SELECT task_id FROM plans WHERE session_id = ?1 ORDER BY position",
            )?;
            let ids = stmt
                .query_map(params![session], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Decision traces within a time window (audit export).
    pub fn traces_between(&self, from: i64, to: i64) -> Result<Vec<DecisionTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, task_id, over_task_id, delta_urgency, delta_sla,
                        delta_staleness, delta_fairness, delta_total, rank_old, rank_new, rationale
                 FROM decision_traces
                 WHERE created_at >= ?1 AND created_at <= ?2
                 ORDER BY id",
            )?;
            let traces = stmt
                .query_map(params![from, to], |row| {
                    Ok(DecisionTrace {
                        session_id: row.get(0)?,
                        task_id: row.get(1)?,
                        over_task_id: row.get(2)?,
                        delta_urgency: row.get(3)?,
                        delta_sla: row.get(4)?,
                        delta_staleness: row.get(5)?,
                        delta_fairness: row.get(6)?,
                        delta_total: row.get(7)?,
                        rank_old: row.get(8)?,
                        rank_new: row.get(9)?,
                        rationale: row.get(10)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(traces)
        })
    }

    /// Count audit events of a given type (diagnostics, tests).
    pub fn audit_event_count(&self, event_type: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_events WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
