//! HTTP handlers for the relay surface.

use super::AppState;
use crate::db::now_ms;
use crate::error::{AppError, ErrorCode};
use crate::planner::{plan_day, PlanRequest};
use crate::triage;
use crate::types::{Task, TaskIntake, TriageResponse};
use crate::webhook::{handle_delivery, WebhookDisposition};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.code {
            ErrorCode::InvariantViolation
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,
            ErrorCode::TaskNotFound
            | ErrorCode::MappingNotFound
            | ErrorCode::OutboxRowNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SignatureFailure => StatusCode::UNAUTHORIZED,
            ErrorCode::Duplicate => StatusCode::NO_CONTENT,
            ErrorCode::Transient | ErrorCode::AdvisorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Permanent => StatusCode::BAD_GATEWAY,
            ErrorCode::LeaseExpired | ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self)).into_response()
    }
}

/// Liveness plus per-dependency readiness booleans.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(Into::into)
        })
        .is_ok();

    Json(json!({
        "ok": db_ok,
        "db": db_ok,
        "backends_configured": !state.backends.is_empty(),
        "advisor_enabled": state.advisor.is_some(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct IntakeParams {
    /// Target backend; defaults to the first configured one.
    pub backend: Option<String>,
}

/// Intake: triage the raw record, persist the task with its outbox intents
/// in one commit, and return the scored summary.
pub async fn intake(
    State(state): State<AppState>,
    Query(params): Query<IntakeParams>,
    Json(raw): Json<TaskIntake>,
) -> Result<Json<TriageResponse>, AppError> {
    let now = now_ms();
    let mut task = triage::triage_intake(&raw, &state.config, now)?;

    // Advisor refinement is layered on top; failures fall back to the
    // deterministic result.
    refine_and_audit(&state, &mut task).await?;

    let backend = resolve_backend(&state, params.backend.as_deref())?;

    // hold_creation blocks backend creation only; the task itself persists.
    let intents = if task.requires_review || backend.is_none() {
        Vec::new()
    } else {
        triage::build_intents(&task, backend.as_deref().unwrap(), &state.config)
    };

    let enqueued = state
        .db
        .create_task_with_intents(&task, &intents)
        .map_err(AppError::from)?;

    state
        .db
        .log_audit_event(
            "task_created",
            Some(&task.id),
            backend.as_deref(),
            Some(&json!({
                "task_type": task.task_type,
                "score": task.score,
                "intents": enqueued,
            })),
            None,
        )
        .map_err(AppError::from)?;

    info!(task = %task.id, task_type = %task.task_type, "intake triaged");

    Ok(Json(TriageResponse {
        id: task.id.clone(),
        task_type: task.task_type.clone(),
        score: task.score.unwrap_or(0.0),
        requires_review: task.requires_review,
        subtasks_created: task.subtasks.len(),
        checklist_items: task.checklist.len(),
    }))
}

/// Run advisor refinement for a freshly scored task and record the outcome.
async fn refine_and_audit(state: &AppState, task: &mut Task) -> Result<(), AppError> {
    match triage::refine(task, state.advisor.as_deref()).await {
        triage::RefineOutcome::Merged(report) => state
            .db
            .log_audit_event(
                "advisor_merged",
                Some(&task.id),
                None,
                Some(&json!({
                    "applied": report.applied,
                    "rejected": report.rejected,
                })),
                None,
            )
            .map_err(AppError::from),
        triage::RefineOutcome::Unavailable(reason) => state
            .db
            .log_audit_event(
                "advisor_unavailable",
                Some(&task.id),
                None,
                Some(&json!({ "reason": reason })),
                None,
            )
            .map_err(AppError::from),
        triage::RefineOutcome::Skipped => Ok(()),
    }
}

fn resolve_backend(state: &AppState, requested: Option<&str>) -> Result<Option<String>, AppError> {
    match requested {
        Some(name) => {
            if state.backends.get(name).is_none() {
                return Err(AppError::invalid_value("backend", "unknown backend"));
            }
            Ok(Some(name.to_string()))
        }
        None => {
            let mut names: Vec<&str> = state.backends.names();
            names.sort();
            Ok(names.first().map(|s| s.to_string()))
        }
    }
}

/// Re-run the triage pipeline on an existing task.
pub async fn retriage(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let mut task = state
        .db
        .get_task(&task_id)
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::task_not_found(&task_id))?;

    triage::retriage(&mut task, &state.config, now_ms());

    // Re-triage re-runs the full pipeline, advisor refinement included; a
    // fresh hold_creation suggestion parks the task for review here too.
    refine_and_audit(&state, &mut task).await?;

    state.db.save_task(&task).map_err(AppError::from)?;

    // Re-sync backends that already hold the task; an unchanged payload
    // hashes to a delivered key and the enqueue no-ops.
    let mut updates = 0;
    if !task.requires_review {
        for (backend, external_id) in state
            .db
            .get_mappings_for_task(&task.id)
            .map_err(AppError::from)?
        {
            let intent =
                triage::build_update_intent(&task, &backend, &external_id, &state.config);
            if state
                .db
                .enqueue_intent(&intent, Some(&task.id))
                .map_err(AppError::from)?
            {
                updates += 1;
            }
        }
    }

    state
        .db
        .log_audit_event(
            "task_retriaged",
            Some(&task.id),
            None,
            Some(&json!({
                "score": task.score,
                "task_type": task.task_type,
                "updates_enqueued": updates,
            })),
            None,
        )
        .map_err(AppError::from)?;

    Ok(Json(task))
}

/// Fetch one task snapshot.
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .db
        .get_task(&task_id)
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::task_not_found(&task_id))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct RebalanceBody {
    pub available_hours: f64,
    #[serde(default)]
    pub client: Option<String>,
}

/// Trigger a rebalance and return the ordered plan plus traces.
pub async fn rebalance(
    State(state): State<AppState>,
    Json(body): Json<RebalanceBody>,
) -> Result<impl IntoResponse, AppError> {
    let plan = plan_day(
        &state.db,
        &state.config,
        now_ms(),
        &PlanRequest {
            available_hours: body.available_hours,
            client: body.client,
        },
    )?;
    Ok(Json(plan))
}

/// Receive a backend webhook: verify, dedup, apply.
pub async fn webhook(
    State(state): State<AppState>,
    Path(backend_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let backend = state
        .backends
        .get(&backend_name)
        .ok_or_else(|| AppError::invalid_value("backend", "unknown backend"))?;

    let header_name = backend.signature().header.clone();
    let provided = headers
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match handle_delivery(&state.db, backend.as_ref(), &body, provided)? {
        WebhookDisposition::Applied | WebhookDisposition::Unmapped => {
            Ok(Json(json!({ "ok": true })).into_response())
        }
        WebhookDisposition::Duplicate => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Outbox counts per status.
pub async fn outbox_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state.db.outbox_stats().map_err(AppError::from)?;
    let total: i64 = stats.values().sum();
    Ok(Json(json!({ "stats": stats, "total": total })))
}

/// Requeue a dead-lettered row (operator action).
pub async fn outbox_requeue(
    State(state): State<AppState>,
    Path(row_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let row = state
        .db
        .get_outbox_row(row_id)
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::outbox_row_not_found(row_id))?;

    state
        .db
        .requeue_dead_letter(row.id)
        .map_err(|e| AppError::invalid_value("id", &e.to_string()))?;

    state
        .db
        .log_audit_event(
            "outbox_requeued",
            row.task_id.as_deref(),
            Some(&row.backend),
            Some(&json!({ "row_id": row.id })),
            None,
        )
        .map_err(AppError::from)?;

    Ok(Json(json!({ "ok": true, "row_id": row.id })))
}

/// Resolve `(backend, external_id)` to the internal task id.
pub async fn mapping_lookup(
    State(state): State<AppState>,
    Path((backend, external_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = state
        .db
        .get_internal_id(&backend, &external_id)
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::mapping_not_found(&backend, &external_id))?;

    Ok(Json(json!({ "task_id": task_id })))
}

#[derive(Debug, Deserialize)]
pub struct TraceWindow {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

/// Export decision traces for a time window.
pub async fn audit_traces(
    State(state): State<AppState>,
    Query(window): Query<TraceWindow>,
) -> Result<impl IntoResponse, AppError> {
    let from = window.from.unwrap_or(0);
    let to = window.to.unwrap_or_else(now_ms);
    let traces = state.db.traces_between(from, to).map_err(AppError::from)?;
    Ok(Json(traces))
}
