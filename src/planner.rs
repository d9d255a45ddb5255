//! Daily planner / rebalancer: selects the day's ordered worklist under
//! global and per-client capacity, nudged by fairness and staleness, and
//! explains every rank change with a decision trace.

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::triage::scoring::{
    baseline_breakdown, hours_to_deadline, rank_cmp, score_task, ScoreBreakdown, ScoreInput,
};
use crate::types::{DayPlan, DecisionTrace, PlanEntry, Task};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const FAIRNESS_ALPHA: f64 = 0.1;
const FAIRNESS_DEFICIT_CLAMP: f64 = 0.1;
const STALENESS_BOOST: f64 = 0.05;
const STALENESS_HOURS: f64 = 72.0;
const FAIRNESS_WINDOW_MS: i64 = 7 * 24 * 3_600_000;

/// Rebalance request.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub available_hours: f64,
    pub client: Option<String>,
}

struct Candidate {
    task: Task,
    breakdown: ScoreBreakdown,
    fairness_boost: f64,
    staleness_boost: f64,
    adjusted_score: f64,
    htd: Option<f64>,
}

/// Signed 7-day fairness deficit per client: `target_share − observed_share`,
/// clamped to ±0.1. Positive means the client has been under-served.
pub fn fairness_deficits(db: &Database, config: &Config, now_ms: i64) -> AppResult<HashMap<String, f64>> {
    let completed = db
        .completed_effort_since(now_ms - FAIRNESS_WINDOW_MS)
        .map_err(AppError::from)?;
    let total: f64 = completed.iter().map(|(_, effort)| effort).sum();

    let mut deficits = HashMap::new();
    for (client, rules) in &config.clients {
        let observed_share = if total > 0.0 {
            completed
                .iter()
                .find(|(c, _)| c == client)
                .map(|(_, effort)| effort / total)
                .unwrap_or(0.0)
        } else {
            // No history: nobody is ahead or behind.
            rules.target_share
        };
        let deficit = (rules.target_share - observed_share)
            .clamp(-FAIRNESS_DEFICIT_CLAMP, FAIRNESS_DEFICIT_CLAMP);
        deficits.insert(client.clone(), deficit);
    }

    Ok(deficits)
}

/// Compute the day plan, persist it with its traces, and return both.
///
/// With a fixed clock, configuration, and task set the output is identical
/// across runs.
pub fn plan_day(
    db: &Database,
    config: &Config,
    now_ms: i64,
    request: &PlanRequest,
) -> AppResult<DayPlan> {
    if request.available_hours <= 0.0 {
        return Err(AppError::invalid_value(
            "available_hours",
            "available_hours must be positive",
        ));
    }

    let tasks = db
        .plan_candidates(request.client.as_deref())
        .map_err(AppError::from)?;
    let deficits = fairness_deficits(db, config, now_ms)?;
    let prior_order = db.latest_plan_order().map_err(AppError::from)?;

    // Recompute scores and apply the ranking adjustments; scoring is pure.
    let mut candidates: Vec<Candidate> = tasks
        .into_iter()
        .map(|task| {
            let client_cfg = config.client(&task.client);
            let outcome = score_task(&task, &config.scoring, &client_cfg, now_ms);
            let input = ScoreInput {
                task: &task,
                scoring: &config.scoring,
                client: &client_cfg,
                now_ms,
            };
            let breakdown = baseline_breakdown(&input);

            let fairness_boost =
                FAIRNESS_ALPHA * deficits.get(&task.client).copied().unwrap_or(0.0);
            let hours_idle = (now_ms - task.last_activity_at) as f64 / 3_600_000.0;
            let staleness_boost = if hours_idle > STALENESS_HOURS {
                STALENESS_BOOST
            } else {
                0.0
            };

            let adjusted_score = outcome.score + fairness_boost + staleness_boost;
            let htd = hours_to_deadline(&task, now_ms);

            Candidate {
                task,
                breakdown,
                fairness_boost,
                staleness_boost,
                adjusted_score,
                htd,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        rank_cmp(
            (&a.task, a.adjusted_score, a.htd),
            (&b.task, b.adjusted_score, b.htd),
        )
    });

    // Greedy pack: walk the whole list so smaller tasks can still be placed
    // after a large one is skipped.
    let mut remaining_hours = request.available_hours;
    let mut remaining_cap: HashMap<String, f64> = HashMap::new();
    let mut picked: Vec<&Candidate> = Vec::new();

    for candidate in &candidates {
        let effort = candidate.task.effort_hours;
        let cap = remaining_cap
            .entry(candidate.task.client.clone())
            .or_insert_with(|| config.client(&candidate.task.client).daily_capacity_hours);

        if effort <= remaining_hours && effort <= *cap {
            remaining_hours -= effort;
            *cap -= effort;
            picked.push(candidate);
        }
    }

    let session_id = Uuid::now_v7().to_string();

    let entries: Vec<PlanEntry> = picked
        .iter()
        .enumerate()
        .map(|(position, candidate)| PlanEntry {
            position: position as i32,
            task_id: candidate.task.id.clone(),
            client: candidate.task.client.clone(),
            effort_hours: candidate.task.effort_hours,
            adjusted_score: candidate.adjusted_score,
        })
        .collect();

    let traces = build_traces(&session_id, &picked, &prior_order);

    db.save_plan(&session_id, &entries, &traces)
        .map_err(AppError::from)?;
    info!(
        session = %session_id,
        planned = entries.len(),
        traces = traces.len(),
        "rebalance complete"
    );

    Ok(DayPlan {
        session_id,
        entries,
        traces,
    })
}

/// Emit one trace per pairwise swap relative to the prior ranking: task A
/// now ranks above task B that used to rank above A.
fn build_traces(
    session_id: &str,
    picked: &[&Candidate],
    prior_order: &[String],
) -> Vec<DecisionTrace> {
    let prior_rank: HashMap<&str, usize> = prior_order
        .iter()
        .enumerate()
        .map(|(rank, id)| (id.as_str(), rank))
        .collect();

    // Tasks the prior plan never saw rank after it, in creation order.
    let mut by_creation: Vec<&str> = picked.iter().map(|c| c.task.id.as_str()).collect();
    by_creation.sort_by_key(|id| {
        picked
            .iter()
            .find(|c| c.task.id == *id)
            .map(|c| (c.task.created_at, c.task.id.clone()))
    });
    let effective_prior = |candidate: &Candidate| {
        prior_rank
            .get(candidate.task.id.as_str())
            .copied()
            .unwrap_or_else(|| {
                let fallback = by_creation
                    .iter()
                    .position(|id| *id == candidate.task.id)
                    .unwrap_or(0);
                prior_order.len() + fallback
            })
    };

    let mut traces = Vec::new();
    for (new_rank_a, a) in picked.iter().enumerate() {
        for b in picked.iter().skip(new_rank_a + 1) {
            let old_a = effective_prior(a);
            let old_b = effective_prior(b);

            // A is above B now; trace it only if that reverses the prior order.
            if old_a <= old_b {
                continue;
            }

            let delta_urgency = a.breakdown.urgency - b.breakdown.urgency;
            let delta_sla = a.breakdown.sla - b.breakdown.sla;
            let delta_staleness = a.staleness_boost - b.staleness_boost;
            let delta_fairness = a.fairness_boost - b.fairness_boost;
            let delta_total = a.adjusted_score - b.adjusted_score;

            traces.push(DecisionTrace {
                session_id: session_id.to_string(),
                task_id: a.task.id.clone(),
                over_task_id: b.task.id.clone(),
                delta_urgency,
                delta_sla,
                delta_staleness,
                delta_fairness,
                delta_total,
                rank_old: old_a as i32,
                rank_new: new_rank_a as i32,
                rationale: format!(
                    "{} moved above {}: Δurgency {:+.3}, Δsla {:+.3}, Δstaleness {:+.3}, Δfairness {:+.3}, Δtotal {:+.3}",
                    a.task.id,
                    b.task.id,
                    delta_urgency,
                    delta_sla,
                    delta_staleness,
                    delta_fairness,
                    delta_total
                ),
            });
        }
    }
    traces
}

