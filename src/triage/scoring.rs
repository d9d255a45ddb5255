//! Priority scoring: the baseline weighted sum plus the optional ensemble
//! (fuzzy-threshold and history-weighted scorers).
//!
//! Every scorer is a pure function of (task, config, now); the scheduler can
//! re-run scoring at any time and get the same answer for the same inputs.

use crate::config::{ClientConfig, ScoringConfig, ScoringMode};
use crate::types::{ComplexityLevel, ScoringMethod, Task, UrgencyLevel};
use std::cmp::Ordering;

/// Per-factor breakdown of a baseline score, all factors in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub urgency: f64,
    pub importance: f64,
    pub effort: f64,
    pub freshness: f64,
    pub sla: f64,
    pub progress: f64,
}

/// Inputs shared by all scorers.
pub struct ScoreInput<'a> {
    pub task: &'a Task,
    pub scoring: &'a ScoringConfig,
    pub client: &'a ClientConfig,
    pub now_ms: i64,
}

/// A pure scoring strategy.
pub trait Scorer {
    fn name(&self) -> &'static str;
    fn score(&self, input: &ScoreInput) -> f64;
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Hours until the deadline; negative when overdue, None without a deadline.
pub fn hours_to_deadline(task: &Task, now_ms: i64) -> Option<f64> {
    task.deadline
        .map(|deadline| (deadline - now_ms) as f64 / 3_600_000.0)
}

fn age_hours(task: &Task, now_ms: i64) -> f64 {
    ((now_ms - task.created_at) as f64 / 3_600_000.0).max(0.0)
}

fn hours_since_activity(task: &Task, now_ms: i64) -> f64 {
    ((now_ms - task.last_activity_at) as f64 / 3_600_000.0).max(0.0)
}

/// Urgency factor: continuous and monotonic decreasing in hours-to-deadline.
/// Overdue work saturates at 1.0; no deadline means no urgency.
pub fn urgency_factor(htd: Option<f64>, horizon_hours: f64) -> f64 {
    match htd {
        None => 0.0,
        Some(h) if h <= 0.0 => 1.0,
        Some(h) => clamp01(1.0 - h / horizon_hours),
    }
}

/// Recent-progress estimate in [0, 1]: activity within the last day counts
/// as full progress, decaying linearly to zero at 24 hours.
fn recent_progress(task: &Task, now_ms: i64) -> f64 {
    clamp01(1.0 - hours_since_activity(task, now_ms) / 24.0)
}

/// Compute the baseline factor breakdown.
pub fn baseline_breakdown(input: &ScoreInput) -> ScoreBreakdown {
    let task = input.task;
    let scoring = input.scoring;
    let htd = hours_to_deadline(task, input.now_ms);
    let age = age_hours(task, input.now_ms);

    let urgency = urgency_factor(htd, scoring.urgency_horizon_hours);
    let importance = clamp01((task.importance as f64 - 1.0) / 4.0);
    let effort = 1.0 - clamp01(task.effort_hours / scoring.effort_cap_hours);
    let freshness = (-age / scoring.freshness_tau_hours).exp();

    let sla_hours = input.client.sla_hours;
    let hours_left_in_sla = (sla_hours - age).max(0.0);
    let sla = clamp01(1.0 - hours_left_in_sla / sla_hours);

    let progress = 1.0 - recent_progress(task, input.now_ms).min(1.0);

    ScoreBreakdown {
        urgency,
        importance,
        effort,
        freshness,
        sla,
        progress,
    }
}

/// Weighted sum of six normalized factors.
pub struct BaselineScorer;

impl Scorer for BaselineScorer {
    fn name(&self) -> &'static str {
        "baseline"
    }

    fn score(&self, input: &ScoreInput) -> f64 {
        let b = baseline_breakdown(input);
        let w = &input.scoring.weights;
        clamp01(
            w.urgency * b.urgency
                + w.importance * b.importance
                + w.effort * b.effort
                + w.freshness * b.freshness
                + w.sla * b.sla
                + w.progress * b.progress,
        )
    }
}

/// Triangular membership: 1.0 at `peak`, falling to 0.0 at `lo` and `hi`.
fn triangular(x: f64, lo: f64, peak: f64, hi: f64) -> f64 {
    if x <= lo || x >= hi {
        0.0
    } else if x <= peak {
        (x - lo) / (peak - lo)
    } else {
        (hi - x) / (hi - peak)
    }
}

/// Fuzzy-threshold scorer.
///
/// Hours-to-deadline is rescaled by the client's `urgency_threshold` before
/// the membership functions are applied, and the client's
/// `complexity_preference` weights how well the task's effort band fits.
pub struct FuzzyScorer;

impl FuzzyScorer {
    fn fuzzy_urgency(htd: Option<f64>, threshold_hours: f64) -> f64 {
        let Some(h) = htd else {
            return 0.1;
        };
        if h <= 0.0 {
            return 1.0;
        }

        // Normalize so a client with a 12h threshold sees 12h the way a
        // default client sees 24h.
        let h = h * 24.0 / threshold_hours.max(1.0);

        let critical = if h < 4.0 { 1.0 - h / 4.0 } else { 0.0 };
        let high = triangular(h, 0.0, 8.0, 24.0);
        let medium = triangular(h, 8.0, 72.0, 168.0);
        let low = clamp01((h - 72.0) / 264.0);

        let total = critical + high + medium + low;
        if total <= 0.0 {
            return 0.1;
        }
        (critical * 1.0 + high * 0.75 + medium * 0.45 + low * 0.15) / total
    }

    fn preference_fit(effort_hours: f64, preference: &str) -> f64 {
        let band = complexity_level(effort_hours);
        let preferred = ComplexityLevel::from_str(preference).unwrap_or(ComplexityLevel::Moderate);

        let distance = (band_index(band) as i32 - band_index(preferred) as i32).abs();
        match distance {
            0 => 1.0,
            1 => 0.66,
            _ => 0.33,
        }
    }
}

fn band_index(band: ComplexityLevel) -> u8 {
    match band {
        ComplexityLevel::Simple => 0,
        ComplexityLevel::Moderate => 1,
        ComplexityLevel::Complex => 2,
        ComplexityLevel::Epic => 3,
    }
}

impl Scorer for FuzzyScorer {
    fn name(&self) -> &'static str {
        "fuzzy"
    }

    fn score(&self, input: &ScoreInput) -> f64 {
        let htd = hours_to_deadline(input.task, input.now_ms);
        let urgency = Self::fuzzy_urgency(htd, input.client.urgency_threshold);
        let fit = Self::preference_fit(
            input.task.effort_hours,
            &input.client.complexity_preference,
        );
        let importance = clamp01((input.task.importance as f64 - 1.0) / 4.0);

        clamp01(0.55 * urgency + 0.25 * fit + 0.20 * importance)
    }
}

/// Completion-rate priors per urgency band, adapted offline. The neutral
/// prior of 0.5 leaves the ranking unchanged relative to the baseline.
#[derive(Debug, Clone, Copy)]
pub struct HistoryPriors {
    pub by_urgency: [f64; 4],
}

impl Default for HistoryPriors {
    fn default() -> Self {
        Self {
            by_urgency: [0.5; 4],
        }
    }
}

/// History-weighted scorer: the baseline total scaled by how reliably work
/// in the task's urgency band has completed on time.
pub struct HistoryScorer {
    pub priors: HistoryPriors,
}

impl Default for HistoryScorer {
    fn default() -> Self {
        Self {
            priors: HistoryPriors::default(),
        }
    }
}

impl Scorer for HistoryScorer {
    fn name(&self) -> &'static str {
        "history"
    }

    fn score(&self, input: &ScoreInput) -> f64 {
        let base = BaselineScorer.score(input);
        let band = urgency_level(hours_to_deadline(input.task, input.now_ms));
        let prior = self.priors.by_urgency[match band {
            UrgencyLevel::Critical => 0,
            UrgencyLevel::High => 1,
            UrgencyLevel::Medium => 2,
            UrgencyLevel::Low => 3,
        }];
        clamp01(base * (0.5 + prior))
    }
}

/// Urgency band for a deadline distance.
pub fn urgency_level(htd: Option<f64>) -> UrgencyLevel {
    match htd {
        Some(h) if h < 4.0 => UrgencyLevel::Critical,
        Some(h) if h < 24.0 => UrgencyLevel::High,
        Some(h) if h < 168.0 => UrgencyLevel::Medium,
        _ => UrgencyLevel::Low,
    }
}

/// Complexity band for an effort estimate.
pub fn complexity_level(effort_hours: f64) -> ComplexityLevel {
    if effort_hours < 2.0 {
        ComplexityLevel::Simple
    } else if effort_hours <= 8.0 {
        ComplexityLevel::Moderate
    } else if effort_hours <= 24.0 {
        ComplexityLevel::Complex
    } else {
        ComplexityLevel::Epic
    }
}

/// Result of scoring a task.
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub score: f64,
    pub urgency_level: UrgencyLevel,
    pub complexity_level: ComplexityLevel,
    pub method: ScoringMethod,
    pub breakdown: ScoreBreakdown,
}

/// Score a task under the configured mode.
pub fn score_task(
    task: &Task,
    scoring: &ScoringConfig,
    client: &ClientConfig,
    now_ms: i64,
) -> ScoreOutcome {
    let input = ScoreInput {
        task,
        scoring,
        client,
        now_ms,
    };

    let breakdown = baseline_breakdown(&input);
    let (score, method) = match scoring.mode {
        ScoringMode::Baseline => (BaselineScorer.score(&input), ScoringMethod::Baseline),
        ScoringMode::Ensemble => {
            let [wb, wf, wh] = scoring.ensemble_weights;
            let combined = wb * BaselineScorer.score(&input)
                + wf * FuzzyScorer.score(&input)
                + wh * HistoryScorer::default().score(&input);
            (clamp01(combined), ScoringMethod::Ensemble)
        }
    };

    ScoreOutcome {
        score,
        urgency_level: urgency_level(hours_to_deadline(task, now_ms)),
        complexity_level: complexity_level(task.effort_hours),
        method,
        breakdown,
    }
}

/// Deterministic ranking comparator: lexicographic by
/// (−score, −hours_to_deadline, created_at, id).
pub fn rank_cmp(
    a: (&Task, f64, Option<f64>),
    b: (&Task, f64, Option<f64>),
) -> Ordering {
    let (task_a, score_a, htd_a) = a;
    let (task_b, score_b, htd_b) = b;

    // No deadline sorts after any deadline among equal scores.
    let key_a = -htd_a.unwrap_or(f64::NEG_INFINITY);
    let key_b = -htd_b.unwrap_or(f64::NEG_INFINITY);

    (-score_a)
        .partial_cmp(&-score_b)
        .unwrap_or(Ordering::Equal)
        .then(key_a.partial_cmp(&key_b).unwrap_or(Ordering::Equal))
        .then(task_a.created_at.cmp(&task_b.created_at))
        .then(task_a.id.cmp(&task_b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::TaskStatus;

    const HOUR_MS: i64 = 3_600_000;

    fn task_at(now: i64, deadline_hours: Option<f64>) -> Task {
        Task {
            id: "tsk_test".to_string(),
            title: "t".to_string(),
            description: String::new(),
            client: "unknown".to_string(),
            task_type: "general".to_string(),
            importance: 3,
            effort_hours: 2.0,
            deadline: deadline_hours.map(|h| now + (h * HOUR_MS as f64) as i64),
            status: TaskStatus::Pending,
            score: None,
            labels: vec![],
            checklist: vec![],
            subtasks: vec![],
            urgency_level: None,
            complexity_level: None,
            scoring_method: None,
            requires_review: false,
            source: "api".to_string(),
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    #[test]
    fn urgency_is_monotonic_in_deadline_distance() {
        let config = Config::default();
        let client = config.client("unknown");
        let now = 1_700_000_000_000;

        let mut last = f64::MAX;
        for hours in [1.0, 6.0, 24.0, 72.0, 168.0, 336.0] {
            let task = task_at(now, Some(hours));
            let outcome = score_task(&task, &config.scoring, &client, now);
            assert!(
                outcome.score < last,
                "score must strictly decrease as deadline recedes (at {}h)",
                hours
            );
            last = outcome.score;
        }
    }

    #[test]
    fn overdue_saturates_urgency() {
        assert_eq!(urgency_factor(Some(-3.0), 336.0), 1.0);
        assert_eq!(urgency_factor(None, 336.0), 0.0);
    }

    #[test]
    fn six_hour_vs_seventy_two_hour_gap_matches_horizon() {
        // Two tasks equal in all but deadline; the urgency factor gap is
        // (72 - 6) / 336 ≈ 0.196.
        let a = urgency_factor(Some(6.0), 336.0);
        let b = urgency_factor(Some(72.0), 336.0);
        assert!((a - b - 0.19642857).abs() < 1e-6);
    }

    #[test]
    fn no_deadline_scores_below_near_deadline() {
        let config = Config::default();
        let client = config.client("unknown");
        let now = 1_700_000_000_000;

        let near = task_at(now, Some(6.0));
        let none = task_at(now, None);

        let near_score = score_task(&near, &config.scoring, &client, now).score;
        let none_score = score_task(&none, &config.scoring, &client, now).score;
        assert!(near_score > none_score);
    }

    #[test]
    fn smaller_effort_scores_higher() {
        let config = Config::default();
        let client = config.client("unknown");
        let now = 1_700_000_000_000;

        let mut small = task_at(now, Some(48.0));
        small.effort_hours = 1.0;
        let mut large = task_at(now, Some(48.0));
        large.effort_hours = 8.0;

        assert!(
            score_task(&small, &config.scoring, &client, now).score
                > score_task(&large, &config.scoring, &client, now).score
        );
    }

    #[test]
    fn ensemble_is_deterministic() {
        let mut config = Config::default();
        config.scoring.mode = crate::config::ScoringMode::Ensemble;
        let client = config.client("unknown");
        let now = 1_700_000_000_000;
        let task = task_at(now, Some(12.0));

        let first = score_task(&task, &config.scoring, &client, now);
        let second = score_task(&task, &config.scoring, &client, now);
        assert_eq!(first.score, second.score);
        assert_eq!(first.method, ScoringMethod::Ensemble);
    }

    #[test]
    fn urgency_bands() {
        assert_eq!(urgency_level(Some(1.0)), UrgencyLevel::Critical);
        assert_eq!(urgency_level(Some(12.0)), UrgencyLevel::High);
        assert_eq!(urgency_level(Some(100.0)), UrgencyLevel::Medium);
        assert_eq!(urgency_level(Some(400.0)), UrgencyLevel::Low);
        assert_eq!(urgency_level(None), UrgencyLevel::Low);
    }

    #[test]
    fn complexity_bands() {
        assert_eq!(complexity_level(1.0), ComplexityLevel::Simple);
        assert_eq!(complexity_level(4.0), ComplexityLevel::Moderate);
        assert_eq!(complexity_level(16.0), ComplexityLevel::Complex);
        assert_eq!(complexity_level(40.0), ComplexityLevel::Epic);
    }

    #[test]
    fn rank_cmp_breaks_ties_deterministically() {
        let now = 1_700_000_000_000;
        let a = task_at(now, Some(6.0));
        let mut b = task_at(now, Some(6.0));
        b.id = "tsk_zzz".to_string();

        // Equal score, equal deadline, equal created_at: id decides.
        assert_eq!(
            rank_cmp((&a, 0.5, Some(6.0)), (&b, 0.5, Some(6.0))),
            Ordering::Less
        );

        // Higher score always wins.
        assert_eq!(
            rank_cmp((&b, 0.6, Some(6.0)), (&a, 0.5, Some(6.0))),
            Ordering::Less
        );
    }
}
