//! Task CRUD and the atomic task-plus-outbox producer commit.

use super::{now_ms, Database};
use crate::types::{
    ComplexityLevel, OutboxStatus, ScoringMethod, Task, TaskStatus, UrgencyLevel,
};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let title: String = row.get("title")?;
    let description: String = row.get("description")?;
    let client: String = row.get("client")?;
    let task_type: String = row.get("task_type")?;
    let importance: i32 = row.get("importance")?;
    let effort_hours: f64 = row.get("effort_hours")?;
    let deadline: Option<i64> = row.get("deadline")?;
    let status: String = row.get("status")?;
    let score: Option<f64> = row.get("score")?;
    let labels_json: String = row.get("labels")?;
    let checklist_json: String = row.get("checklist")?;
    let subtasks_json: String = row.get("subtasks")?;
    let urgency_level: Option<String> = row.get("urgency_level")?;
    let complexity_level: Option<String> = row.get("complexity_level")?;
    let scoring_method: Option<String> = row.get("scoring_method")?;
    let requires_review: bool = row.get("requires_review")?;
    let source: String = row.get("source")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    let last_activity_at: i64 = row.get("last_activity_at")?;

    Ok(Task {
        id,
        title,
        description,
        client,
        task_type,
        importance,
        effort_hours,
        deadline,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        score,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        checklist: serde_json::from_str(&checklist_json).unwrap_or_default(),
        subtasks: serde_json::from_str(&subtasks_json).unwrap_or_default(),
        urgency_level: urgency_level.as_deref().and_then(UrgencyLevel::from_str),
        complexity_level: complexity_level
            .as_deref()
            .and_then(ComplexityLevel::from_str),
        scoring_method: scoring_method.as_deref().and_then(ScoringMethod::from_str),
        requires_review,
        source,
        created_at,
        updated_at,
        last_activity_at,
    })
}

/// Internal helper to get a task using an existing connection.
fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    let result = stmt.query_row(params![task_id], parse_task_row);

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn insert_task_internal(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (
            id, title, description, client, task_type, importance, effort_hours,
            deadline, status, score, labels, checklist, subtasks,
            urgency_level, complexity_level, scoring_method, requires_review,
            source, created_at, updated_at, last_activity_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            task.id,
            task.title,
            task.description,
            task.client,
            task.task_type,
            task.importance,
            task.effort_hours,
            task.deadline,
            task.status.as_str(),
            task.score,
            serde_json::to_string(&task.labels)?,
            serde_json::to_string(&task.checklist)?,
            serde_json::to_string(&task.subtasks)?,
            task.urgency_level.map(|u| u.as_str()),
            task.complexity_level.map(|c| c.as_str()),
            task.scoring_method.map(|m| m.as_str()),
            task.requires_review,
            task.source,
            task.created_at,
            task.updated_at,
            task.last_activity_at,
        ],
    )?;
    Ok(())
}

/// An intended backend side effect, enqueued with the task in one commit.
#[derive(Debug, Clone)]
pub struct OutboxIntent {
    pub operation: String,
    pub backend: String,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub max_retries: i32,
}

pub(crate) fn enqueue_intent_internal(
    conn: &Connection,
    intent: &OutboxIntent,
    task_id: Option<&str>,
    now: i64,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO outbox (
            operation, backend, endpoint, payload, idempotency_key,
            status, retry_count, max_retries, task_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?9)",
        params![
            intent.operation,
            intent.backend,
            intent.endpoint,
            serde_json::to_string(&intent.payload)?,
            intent.idempotency_key,
            OutboxStatus::Pending.as_str(),
            intent.max_retries,
            task_id,
            now,
        ],
    )?;
    Ok(inserted > 0)
}

impl Database {
    /// Persist a triaged task together with its outbox intents in one commit.
    ///
    /// Duplicate idempotency keys are no-ops; the returned count is how many
    /// intents were actually enqueued.
    pub fn create_task_with_intents(
        &self,
        task: &Task,
        intents: &[OutboxIntent],
    ) -> Result<usize> {
        let now = now_ms();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            insert_task_internal(&tx, task)?;

            let mut enqueued = 0;
            for intent in intents {
                if enqueue_intent_internal(&tx, intent, Some(&task.id), now)? {
                    enqueued += 1;
                }
            }

            tx.commit()?;
            Ok(enqueued)
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Overwrite the mutable fields of a task after a re-triage or merge.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET
                    title = ?1, description = ?2, client = ?3, task_type = ?4,
                    importance = ?5, effort_hours = ?6, deadline = ?7, score = ?8,
                    labels = ?9, checklist = ?10, subtasks = ?11,
                    urgency_level = ?12, complexity_level = ?13, scoring_method = ?14,
                    requires_review = ?15, updated_at = ?16
                 WHERE id = ?17",
                params![
                    task.title,
                    task.description,
                    task.client,
                    task.task_type,
                    task.importance,
                    task.effort_hours,
                    task.deadline,
                    task.score,
                    serde_json::to_string(&task.labels)?,
                    serde_json::to_string(&task.checklist)?,
                    serde_json::to_string(&task.subtasks)?,
                    task.urgency_level.map(|u| u.as_str()),
                    task.complexity_level.map(|c| c.as_str()),
                    task.scoring_method.map(|m| m.as_str()),
                    task.requires_review,
                    now,
                    task.id,
                ],
            )?;

            if updated == 0 {
                return Err(anyhow!("Task not found: {}", task.id));
            }
            Ok(())
        })
    }

    /// Update only the score and derived metadata (aging re-score job).
    pub fn update_score(
        &self,
        task_id: &str,
        score: f64,
        urgency: UrgencyLevel,
        complexity: ComplexityLevel,
        method: ScoringMethod,
    ) -> Result<()> {
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET score = ?1, urgency_level = ?2, complexity_level = ?3,
                    scoring_method = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    score,
                    urgency.as_str(),
                    complexity.as_str(),
                    method.as_str(),
                    now,
                    task_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Apply a status transition under the monotonicity rule.
    ///
    /// Regressions are rejected unless `event_ts` is newer than the task's
    /// `updated_at` (out-of-order webhook events are ignored, not errors).
    /// Returns true when the status actually changed.
    pub fn set_status(
        &self,
        task_id: &str,
        to: TaskStatus,
        event_ts: Option<i64>,
    ) -> Result<bool> {
        let now = now_ms();

        self.with_conn(|conn| {
            let task = get_task_internal(conn, task_id)?
                .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;

            if task.status == to {
                return Ok(false);
            }

            // A regression (including out of a terminal state) applies only
            // when the event timestamp is newer than the stored state.
            let allowed = task.status.can_transition_to(to)
                || event_ts.is_some_and(|ts| ts > task.updated_at);

            if !allowed {
                return Ok(false);
            }

            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2,
                    last_activity_at = MAX(last_activity_at, ?2)
                 WHERE id = ?3",
                params![to.as_str(), now, task_id],
            )?;
            Ok(true)
        })
    }

    /// Bump `last_activity_at` (webhook activity, progress signals).
    pub fn touch_activity(&self, task_id: &str, at: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET last_activity_at = MAX(last_activity_at, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![at, now_ms(), task_id],
            )?;
            Ok(())
        })
    }

    /// Planner candidates: pending or in-progress tasks not held for review.
    pub fn plan_candidates(&self, client: Option<&str>) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT * FROM tasks
                 WHERE status IN ('pending', 'in_progress') AND requires_review = 0",
            );
            if client.is_some() {
                sql.push_str(" AND client = ?1");
            }
            sql.push_str(" ORDER BY created_at");

            let mut stmt = conn.prepare(&sql)?;
            let tasks = if let Some(c) = client {
                stmt.query_map(params![c], parse_task_row)?
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                stmt.query_map([], parse_task_row)?
                    .collect::<Result<Vec<_>, _>>()?
            };

            Ok(tasks)
        })
    }

    /// Non-terminal tasks whose deadline falls within the next `hours`.
    pub fn tasks_with_deadline_within(&self, now: i64, hours: i64) -> Result<Vec<Task>> {
        let cutoff = now + hours * 3_600_000;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE deadline IS NOT NULL AND deadline <= ?1
                   AND status NOT IN ('completed', 'cancelled')
                 ORDER BY deadline",
            )?;
            let tasks = stmt
                .query_map(params![cutoff], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Non-terminal tasks with no activity since `cutoff`.
    pub fn stale_tasks(&self, cutoff: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE last_activity_at < ?1
                   AND status NOT IN ('completed', 'cancelled')
                 ORDER BY last_activity_at",
            )?;
            let tasks = stmt
                .query_map(params![cutoff], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Completed effort hours per client since `since` (fairness window).
    pub fn completed_effort_since(&self, since: i64) -> Result<Vec<(String, f64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT client, SUM(effort_hours) FROM tasks
                 WHERE status = 'completed' AND updated_at >= ?1
                 GROUP BY client",
            )?;
            let rows = stmt
                .query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
