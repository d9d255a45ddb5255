//! Triage pipeline: normalize → classify → fill defaults → derive children
//! → score, with optional advisor refinement merged under an allow-list.
//!
//! The whole pipeline is deterministic and idempotent: re-running triage on
//! an already-triaged task is a fixed point.

pub mod scoring;

use crate::advisor::{Advisor, Snapshot, Suggestion};
use crate::config::Config;
use crate::db::tasks::OutboxIntent;
use crate::error::{AppError, AppResult};
use crate::outbox::idempotency_key;
use crate::types::{
    Task, TaskIntake, TaskStatus, OP_ADD_CHECKLIST_ITEM, OP_ADD_SUBTASK, OP_CREATE_TASK,
    OP_UPDATE_TASK,
};
use chrono::DateTime;
use serde_json::json;
use uuid::Uuid;

/// Normalize a raw intake record into a task.
///
/// Trims whitespace, case-folds the client tag, extracts a `[client]` title
/// prefix when no client was given, parses the deadline as UTC, and assigns
/// the internal id.
pub fn normalize(intake: &TaskIntake, now_ms: i64) -> AppResult<Task> {
    let mut title = intake.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::missing_field("title"));
    }

    let mut client = intake.client.trim().to_lowercase();
    if client.is_empty() {
        client = "unknown".to_string();
    }

    // A "[acme] fix login" title names the client when intake did not.
    if client == "unknown" {
        if let Some((tag, rest)) = extract_client_prefix(&title) {
            client = tag;
            title = rest;
        }
    }

    let deadline = match &intake.deadline {
        None => None,
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|_| {
                AppError::invalid_value("deadline", "deadline must be an RFC 3339 timestamp")
            })?;
            Some(parsed.timestamp_millis())
        }
    };

    if let Some(deadline) = deadline {
        if deadline <= now_ms {
            return Err(AppError::invariant("deadline must be in the future"));
        }
    }

    if let Some(importance) = intake.importance {
        if !(1..=5).contains(&importance) {
            return Err(AppError::invalid_value(
                "importance",
                "importance must be in [1, 5]",
            ));
        }
    }

    if let Some(effort) = intake.effort_hours {
        if effort <= 0.0 {
            return Err(AppError::invalid_value(
                "effort_hours",
                "effort_hours must be positive",
            ));
        }
    }

    let id = format!("tsk_{}", &Uuid::new_v4().simple().to_string()[..8]);

    Ok(Task {
        id,
        title,
        description: intake
            .description
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string(),
        client,
        task_type: "general".to_string(),
        importance: intake.importance.unwrap_or(0),
        effort_hours: intake.effort_hours.unwrap_or(0.0),
        deadline,
        status: TaskStatus::Pending,
        score: None,
        labels: intake
            .labels
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        checklist: Vec::new(),
        subtasks: Vec::new(),
        urgency_level: None,
        complexity_level: None,
        scoring_method: None,
        requires_review: false,
        source: intake.source.clone(),
        created_at: now_ms,
        updated_at: now_ms,
        last_activity_at: now_ms,
    })
}

fn extract_client_prefix(title: &str) -> Option<(String, String)> {
    let rest = title.strip_prefix('[')?;
    let close = rest.find(']')?;
    let tag = rest[..close].trim().to_lowercase();
    if tag.is_empty() || !tag.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    let remainder = rest[close + 1..].trim().to_string();
    if remainder.is_empty() {
        return None;
    }
    Some((tag, remainder))
}

/// Classify a task by keyword match over title + description.
///
/// The type with the most keyword hits wins; ties go to the earliest type in
/// the configured classification order. No hits fall back to `general`.
pub fn classify(task: &Task, config: &Config) -> String {
    let text = format!(
        "{} {}",
        task.title.to_lowercase(),
        task.description.to_lowercase()
    );

    let mut best: Option<(&str, usize)> = None;
    for type_name in &config.classify_order {
        let Some(rules) = config.task_types.get(type_name) else {
            continue;
        };
        let hits = rules
            .classify_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count();
        if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
            best = Some((type_name, hits));
        }
    }

    best.map(|(name, _)| name.to_string())
        .unwrap_or_else(|| "general".to_string())
}

/// Fill missing effort, importance, and labels from the type's defaults;
/// apply the client's importance bias, clamped back to [1, 5].
pub fn fill_defaults(task: &mut Task, config: &Config) {
    let type_cfg = config.task_type(&task.task_type);
    let client_cfg = config.client(&task.client);

    if task.effort_hours <= 0.0 {
        task.effort_hours = type_cfg.default_effort_hours;
    }

    // Bias rides along only when the default is filled in; an explicitly
    // supplied importance stands as given, which keeps the fill idempotent.
    if !(1..=5).contains(&task.importance) {
        let biased =
            (type_cfg.default_importance as f64 * client_cfg.importance_bias).round() as i32;
        task.importance = biased.clamp(1, 5);
    }

    for label in &type_cfg.labels {
        if !task.labels.contains(label) {
            task.labels.push(label.clone());
        }
    }
}

/// Instantiate checklist and subtask templates, substituting `{client}` and
/// `{title}`. Existing children are kept (the derivation is a one-shot).
pub fn derive_children(task: &mut Task, config: &Config) {
    let type_cfg = config.task_type(&task.task_type);

    let substitute = |template: &str| {
        template
            .replace("{client}", &task.client)
            .replace("{title}", &task.title)
    };

    if task.checklist.is_empty() {
        task.checklist = type_cfg.checklist_template.iter().map(|t| substitute(t)).collect();
    }
    if task.subtasks.is_empty() {
        task.subtasks = type_cfg.subtasks_template.iter().map(|t| substitute(t)).collect();
    }
}

/// Recompute the score and derived metadata in place.
pub fn score(task: &mut Task, config: &Config, now_ms: i64) {
    let client_cfg = config.client(&task.client);
    let outcome = scoring::score_task(task, &config.scoring, &client_cfg, now_ms);

    task.score = Some(outcome.score);
    task.urgency_level = Some(outcome.urgency_level);
    task.complexity_level = Some(outcome.complexity_level);
    task.scoring_method = Some(outcome.method);
}

/// Run the full deterministic pipeline on a fresh intake.
pub fn triage_intake(intake: &TaskIntake, config: &Config, now_ms: i64) -> AppResult<Task> {
    let mut task = normalize(intake, now_ms)?;
    task.task_type = classify(&task, config);
    fill_defaults(&mut task, config);
    derive_children(&mut task, config);
    score(&mut task, config, now_ms);
    Ok(task)
}

/// Re-run classification, defaults, derivation, and scoring on an existing
/// task. Classification failures fall back to the current type rather than
/// rejecting the task.
pub fn retriage(task: &mut Task, config: &Config, now_ms: i64) {
    task.task_type = classify(task, config);
    fill_defaults(task, config);
    derive_children(task, config);
    score(task, config, now_ms);
}

/// How advisor refinement ended for one pipeline run.
#[derive(Debug)]
pub enum RefineOutcome {
    /// A suggestion arrived and was merged under the allow-list.
    Merged(MergeReport),
    /// Advisor configured but unreachable; the deterministic result stands.
    Unavailable(String),
    /// No advisor configured.
    Skipped,
}

/// Layer advisor refinement over the deterministic pipeline result.
///
/// Both intake and re-triage run this after scoring. Failures are non-fatal
/// by contract: the task keeps its deterministic body and the caller records
/// the outcome in the audit log.
pub async fn refine(task: &mut Task, advisor: Option<&dyn Advisor>) -> RefineOutcome {
    let Some(advisor) = advisor else {
        return RefineOutcome::Skipped;
    };

    match advisor.refine(&Snapshot::of(task)).await {
        Ok(suggestion) => RefineOutcome::Merged(merge_suggestion(task, &suggestion)),
        Err(e) => RefineOutcome::Unavailable(e.to_string()),
    }
}

/// Fields an advisor merge actually changed, for the audit trail.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub applied: Vec<String>,
    pub rejected: Vec<String>,
}

/// Merge an advisor suggestion under the allow-list policy.
///
/// Only additive label/subtask/checklist suggestions, a score override in
/// [0, 1] (merged as `max(override, computed)`), and the `hold_creation`
/// flag are honored. Everything else the adapter may have returned is
/// ignored by construction of [`Suggestion`].
pub fn merge_suggestion(task: &mut Task, suggestion: &Suggestion) -> MergeReport {
    let mut report = MergeReport::default();

    for label in &suggestion.labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if !task.labels.iter().any(|l| l == label) {
            task.labels.push(label.to_string());
            report.applied.push(format!("label:{}", label));
        }
    }

    for subtask in &suggestion.subtasks {
        let subtask = subtask.trim();
        if subtask.is_empty() {
            continue;
        }
        if !task.subtasks.iter().any(|s| s == subtask) {
            task.subtasks.push(subtask.to_string());
            report.applied.push(format!("subtask:{}", subtask));
        }
    }

    for item in &suggestion.checklist {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if !task.checklist.iter().any(|c| c == item) {
            task.checklist.push(item.to_string());
            report.applied.push(format!("checklist:{}", item));
        }
    }

    if let Some(override_score) = suggestion.score_override {
        if (0.0..=1.0).contains(&override_score) {
            let current = task.score.unwrap_or(0.0);
            if override_score > current {
                task.score = Some(override_score);
                report.applied.push(format!("score_override:{:.3}", override_score));
            }
        } else {
            report
                .rejected
                .push(format!("score_override:{:.3}", override_score));
        }
    }

    if suggestion.hold_creation {
        task.requires_review = true;
        report.applied.push("hold_creation".to_string());
    }

    report
}

/// Build the outbox intents that mirror a triaged task to one backend:
/// a create, one add_subtask per subtask, one add_checklist_item per item.
///
/// Keys are content hashes, so re-running the same producer yields
/// insert-conflict no-ops.
pub fn build_intents(task: &Task, backend: &str, config: &Config) -> Vec<OutboxIntent> {
    let max_retries = config.outbox.max_retries;
    let mut intents = Vec::with_capacity(1 + task.subtasks.len() + task.checklist.len());

    let create_payload = json!({
        "task_id": task.id,
        "title": task.title,
        "description": task.description,
        "client": task.client,
        "labels": task.labels,
        "importance": task.importance,
        "deadline": task.deadline,
    });
    intents.push(OutboxIntent {
        operation: OP_CREATE_TASK.to_string(),
        backend: backend.to_string(),
        endpoint: "/tasks".to_string(),
        idempotency_key: idempotency_key(backend, OP_CREATE_TASK, "/tasks", &create_payload),
        payload: create_payload,
        max_retries,
    });

    for (index, subtask) in task.subtasks.iter().enumerate() {
        let payload = json!({
            "task_id": task.id,
            "position": index,
            "title": subtask,
        });
        intents.push(OutboxIntent {
            operation: OP_ADD_SUBTASK.to_string(),
            backend: backend.to_string(),
            endpoint: "/subtasks".to_string(),
            idempotency_key: idempotency_key(backend, OP_ADD_SUBTASK, "/subtasks", &payload),
            payload,
            max_retries,
        });
    }

    for (index, item) in task.checklist.iter().enumerate() {
        let payload = json!({
            "task_id": task.id,
            "position": index,
            "text": item,
        });
        intents.push(OutboxIntent {
            operation: OP_ADD_CHECKLIST_ITEM.to_string(),
            backend: backend.to_string(),
            endpoint: "/checklist".to_string(),
            idempotency_key: idempotency_key(backend, OP_ADD_CHECKLIST_ITEM, "/checklist", &payload),
            payload,
            max_retries,
        });
    }

    intents
}

/// Build the intent that re-syncs a task's mutable fields to a backend it is
/// already bound to. The payload carries the current state, so a retriage
/// that changed nothing hashes to the previously delivered key and no-ops.
pub fn build_update_intent(
    task: &Task,
    backend: &str,
    external_id: &str,
    config: &Config,
) -> OutboxIntent {
    let payload = json!({
        "task_id": task.id,
        "external_id": external_id,
        "title": task.title,
        "description": task.description,
        "labels": task.labels,
        "importance": task.importance,
        "deadline": task.deadline,
        "score": task.score,
        "status": task.status.as_str(),
    });
    OutboxIntent {
        operation: OP_UPDATE_TASK.to_string(),
        backend: backend.to_string(),
        endpoint: "/tasks/update".to_string(),
        idempotency_key: idempotency_key(backend, OP_UPDATE_TASK, "/tasks/update", &payload),
        payload,
        max_retries: config.outbox.max_retries,
    }
}
