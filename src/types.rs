//! Core domain types for the task relay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// High-level task state.
///
/// Transitions are monotonic (pending → in_progress → completed/cancelled)
/// except for the blocked ⇄ in_progress pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states retire the task; it is never deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Ordering rank for the monotonicity rule. Blocked and in_progress share
    /// a rank so the pair can swap freely.
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::InProgress | TaskStatus::Blocked => 1,
            TaskStatus::Completed | TaskStatus::Cancelled => 2,
        }
    }

    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        if *self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        to.rank() >= self.rank()
    }
}

/// Derived urgency band, computed from hours to deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::Critical => "critical",
            UrgencyLevel::High => "high",
            UrgencyLevel::Medium => "medium",
            UrgencyLevel::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(UrgencyLevel::Critical),
            "high" => Some(UrgencyLevel::High),
            "medium" => Some(UrgencyLevel::Medium),
            "low" => Some(UrgencyLevel::Low),
            _ => None,
        }
    }
}

/// Derived complexity band, computed from effort hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
    Epic,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLevel::Simple => "simple",
            ComplexityLevel::Moderate => "moderate",
            ComplexityLevel::Complex => "complex",
            ComplexityLevel::Epic => "epic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(ComplexityLevel::Simple),
            "moderate" => Some(ComplexityLevel::Moderate),
            "complex" => Some(ComplexityLevel::Complex),
            "epic" => Some(ComplexityLevel::Epic),
            _ => None,
        }
    }
}

/// Which scorer produced the task's current score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    Baseline,
    Ensemble,
}

impl ScoringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMethod::Baseline => "baseline",
            ScoringMethod::Ensemble => "ensemble",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(ScoringMethod::Baseline),
            "ensemble" => Some(ScoringMethod::Ensemble),
            _ => None,
        }
    }
}

/// Raw intake record submitted by an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIntake {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_client")]
    pub client: String,
    /// RFC 3339 timestamp; parsed as UTC.
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub importance: Option<i32>,
    #[serde(default)]
    pub effort_hours: Option<f64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_client() -> String {
    "unknown".to_string()
}

fn default_source() -> String {
    "api".to_string()
}

/// Normalized task as held by the store.
///
/// Timestamps are unix milliseconds; `deadline` is nullable and, when set,
/// strictly after `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub client: String,
    pub task_type: String,
    pub importance: i32,
    pub effort_hours: f64,
    pub deadline: Option<i64>,
    pub status: TaskStatus,
    pub score: Option<f64>,
    pub labels: Vec<String>,
    pub checklist: Vec<String>,
    pub subtasks: Vec<String>,
    pub urgency_level: Option<UrgencyLevel>,
    pub complexity_level: Option<ComplexityLevel>,
    pub scoring_method: Option<ScoringMethod>,
    pub requires_review: bool,
    pub source: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_activity_at: i64,
}

/// Outbox row state.
///
/// `delivered` and `dead_letter` are terminal. `failed` only appears
/// transiently inside a worker before the row is re-queued or dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Inflight,
    Delivered,
    Failed,
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Inflight => "inflight",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "inflight" => Some(OutboxStatus::Inflight),
            "delivered" => Some(OutboxStatus::Delivered),
            "failed" => Some(OutboxStatus::Failed),
            "dead_letter" => Some(OutboxStatus::DeadLetter),
            _ => None,
        }
    }
}

/// A durable intent to call a backend; the unit of reliable delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub operation: String,
    pub backend: String,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub task_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outbox operation names understood by backends.
pub const OP_CREATE_TASK: &str = "create_task";
pub const OP_ADD_SUBTASK: &str = "add_subtask";
pub const OP_ADD_CHECKLIST_ITEM: &str = "add_checklist_item";
pub const OP_UPDATE_TASK: &str = "update_task";
pub const OP_NOTIFY: &str = "notify";

/// A change event received from a backend webhook, reduced to the fields the
/// intake pipeline acts on.
#[derive(Debug, Clone)]
pub struct BackendEvent {
    pub delivery_id: String,
    pub external_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// Event timestamp in unix milliseconds, when the backend provides one.
    pub event_timestamp: Option<i64>,
}

/// One entry of an emitted day plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub position: i32,
    pub task_id: String,
    pub client: String,
    pub effort_hours: f64,
    pub adjusted_score: f64,
}

/// Audit record explaining one rank change in a rebalanced plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub session_id: String,
    pub task_id: String,
    pub over_task_id: String,
    pub delta_urgency: f64,
    pub delta_sla: f64,
    pub delta_staleness: f64,
    pub delta_fairness: f64,
    pub delta_total: f64,
    pub rank_old: i32,
    pub rank_new: i32,
    pub rationale: String,
}

/// Result of a rebalance run: the ordered plan plus its traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayPlan {
    pub session_id: String,
    pub entries: Vec<PlanEntry>,
    pub traces: Vec<DecisionTrace>,
}

/// Response body for the intake endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResponse {
    pub id: String,
    pub task_type: String,
    pub score: f64,
    pub requires_review: bool,
    pub subtasks_created: usize,
    pub checklist_items: usize,
}

/// Outbox counts per status, for the operator surface.
pub type OutboxStats = HashMap<String, i64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(Blocked.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn outbox_status_round_trips() {
        for s in [
            OutboxStatus::Pending,
            OutboxStatus::Inflight,
            OutboxStatus::Delivered,
            OutboxStatus::Failed,
            OutboxStatus::DeadLetter,
        ] {
            assert_eq!(OutboxStatus::from_str(s.as_str()), Some(s));
        }
    }
}
