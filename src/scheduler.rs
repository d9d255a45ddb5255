//! Periodic jobs: outbox ticks, aging re-scores, stale nudges, and ledger
//! pruning. Each job runs on its own interval; overlapping runs across
//! processes are prevented by advisory locks keyed by job name.

use crate::backends::BackendRegistry;
use crate::config::Config;
use crate::db::tasks::OutboxIntent;
use crate::db::{day_stamp, now_ms, Database};
use crate::outbox::{nudge_key, reclaim_leases, OutboxWorker};
use crate::triage::scoring::score_task;
use crate::types::OP_NOTIFY;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const JOB_RESCORE: &str = "rescore_aging";
const JOB_NUDGE: &str = "stale_nudge";
const JOB_REBALANCE: &str = "rebalance";
const JOB_PRUNE: &str = "retention_prune";
const PRUNE_INTERVAL_S: u64 = 6 * 3600;

/// Delivered outbox rows are history after a week; dead letters are kept.
const DELIVERED_RETENTION_DAYS: i64 = 7;

/// Deadline window for the aging re-score job.
const RESCORE_DEADLINE_HOURS: i64 = 48;

/// Spawn every periodic job plus the outbox worker pool. The returned
/// handles live as long as the process.
pub fn spawn_jobs(
    db: Database,
    config: Arc<Config>,
    registry: Arc<BackendRegistry>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for worker_index in 0..config.server.workers.max(1) {
        let worker = OutboxWorker::new(db.clone(), Arc::clone(&registry), config.outbox.clone());
        let tick = Duration::from_millis(config.scheduler.outbox_tick_ms.max(100));
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if worker_index == 0 {
                    if let Err(e) = reclaim_leases(&db) {
                        warn!("lease reclaim failed: {}", e);
                    }
                }
                match worker.tick().await {
                    Ok(summary) if summary.claimed > 0 => {
                        debug!(
                            worker = worker_index,
                            claimed = summary.claimed,
                            delivered = summary.delivered,
                            retried = summary.retried,
                            dead_lettered = summary.dead_lettered,
                            "outbox tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(worker = worker_index, "outbox tick failed: {}", e),
                }
            }
        }));
    }

    {
        let db = db.clone();
        let config = Arc::clone(&config);
        let interval_s = config.scheduler.rescore_interval_s.max(1);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                run_locked(&db, JOB_RESCORE, interval_s * 1000, || {
                    rescore_aging(&db, &config)
                });
            }
        }));
    }

    {
        let db = db.clone();
        let config = Arc::clone(&config);
        let interval_s = config.scheduler.nudge_interval_s.max(1);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                run_locked(&db, JOB_NUDGE, interval_s * 1000, || {
                    nudge_stale(&db, &config)
                });
            }
        }));
    }

    if config.scheduler.rebalance_interval_s > 0 {
        let db = db.clone();
        let config = Arc::clone(&config);
        let interval_s = config.scheduler.rebalance_interval_s;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                run_locked(&db, JOB_REBALANCE, interval_s * 1000, || {
                    rebalance(&db, &config)
                });
            }
        }));
    }

    {
        let db = db.clone();
        let ttl_days = config.scheduler.ledger_ttl_days;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(PRUNE_INTERVAL_S));
            loop {
                interval.tick().await;
                run_locked(&db, JOB_PRUNE, PRUNE_INTERVAL_S * 1000, || {
                    prune_retention(&db, ttl_days)
                });
            }
        }));
    }

    info!(
        workers = config.server.workers.max(1),
        "scheduler jobs started"
    );
    handles
}

/// Run a job body under its advisory lock; skip the round when another
/// holder is active.
fn run_locked<F>(db: &Database, job: &str, ttl_ms: u64, body: F)
where
    F: FnOnce() -> Result<()>,
{
    let holder = format!("pid-{}", std::process::id());
    match db.try_acquire_job_lock(job, &holder, ttl_ms as i64) {
        Ok(true) => {
            if let Err(e) = body() {
                warn!(job, "job failed: {}", e);
            }
            if let Err(e) = db.release_job_lock(job, &holder) {
                warn!(job, "lock release failed: {}", e);
            }
        }
        Ok(false) => debug!(job, "skipped; lock held elsewhere"),
        Err(e) => warn!(job, "lock acquisition failed: {}", e),
    }
}

/// Recompute scores for tasks whose deadline is inside the 48h window.
pub fn rescore_aging(db: &Database, config: &Config) -> Result<()> {
    let now = now_ms();
    let tasks = db.tasks_with_deadline_within(now, RESCORE_DEADLINE_HOURS)?;
    let mut rescored = 0;

    for task in tasks {
        let client_cfg = config.client(&task.client);
        let outcome = score_task(&task, &config.scoring, &client_cfg, now);

        if task.score != Some(outcome.score) {
            db.update_score(
                &task.id,
                outcome.score,
                outcome.urgency_level,
                outcome.complexity_level,
                outcome.method,
            )?;
            db.log_audit_event(
                "score_recomputed",
                Some(&task.id),
                None,
                Some(&json!({
                    "old": task.score,
                    "new": outcome.score,
                })),
                None,
            )?;
            rescored += 1;
        }
    }

    if rescored > 0 {
        info!(rescored, "aging re-score pass complete");
    }
    Ok(())
}

/// Flag tasks with no recent activity and enqueue a notification intent.
///
/// The notification key is (task, UTC day), so a task is nudged at most once
/// per day no matter how often the job runs.
pub fn nudge_stale(db: &Database, config: &Config) -> Result<()> {
    let now = now_ms();
    let cutoff = now - (config.scheduler.stale_threshold_hours * 3_600_000.0) as i64;
    let stale = db.stale_tasks(cutoff)?;
    let day = day_stamp(now);
    let mut nudged = 0;

    for task in stale {
        // The (task, day) key allows one nudge per day, so it goes to the
        // task's primary binding; an unmapped task is only flagged in the
        // audit log.
        let idle_hours = (now - task.last_activity_at) / 3_600_000;
        for (backend, external_id) in db.get_mappings_for_task(&task.id)?.into_iter().take(1) {
            let intent = OutboxIntent {
                operation: OP_NOTIFY.to_string(),
                backend,
                endpoint: "/notifications".to_string(),
                payload: json!({
                    "task_id": task.id,
                    "external_id": external_id,
                    "title": task.title,
                    "client": task.client,
                    "idle_hours": idle_hours,
                    "score": task.score,
                    "day": day,
                }),
                idempotency_key: nudge_key(&task.id, &day),
                max_retries: config.outbox.max_retries,
            };
            if db.enqueue_intent(&intent, Some(&task.id))? {
                nudged += 1;
            }
        }

        db.log_audit_event(
            "stale_flagged",
            Some(&task.id),
            None,
            Some(&json!({ "idle_hours": idle_hours })),
            None,
        )?;
    }

    if nudged > 0 {
        info!(nudged, "stale nudges enqueued");
    }
    Ok(())
}

/// Periodic rebalance: re-run the planner with the configured hours and
/// persist the plan and traces.
pub fn rebalance(db: &Database, config: &Config) -> Result<()> {
    let plan = crate::planner::plan_day(
        db,
        config,
        now_ms(),
        &crate::planner::PlanRequest {
            available_hours: config.scheduler.rebalance_hours,
            client: None,
        },
    )?;
    info!(
        session = %plan.session_id,
        planned = plan.entries.len(),
        "scheduled rebalance complete"
    );
    Ok(())
}

/// Drop seen-delivery ledger entries and delivered outbox rows past their
/// retention windows.
pub fn prune_retention(db: &Database, ledger_ttl_days: u32) -> Result<()> {
    let now = now_ms();

    let ledger_cutoff = now - (ledger_ttl_days as i64) * 24 * 3_600_000;
    let ledger_pruned = db.prune_deliveries(ledger_cutoff)?;

    let outbox_cutoff = now - DELIVERED_RETENTION_DAYS * 24 * 3_600_000;
    let outbox_pruned = db.prune_delivered(outbox_cutoff)?;

    if ledger_pruned > 0 || outbox_pruned > 0 {
        info!(ledger_pruned, outbox_pruned, "retention prune complete");
    }
    Ok(())
}
