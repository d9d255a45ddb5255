//! Configuration types and structures.
//!
//! Config is read once at startup and treated as immutable for the process
//! lifetime.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default HTTP port for the relay.
pub const DEFAULT_PORT: u16 = 8974;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Port for the HTTP surface.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of concurrent outbox workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-relay.db")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_workers() -> usize {
    2
}

/// Scoring mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    #[default]
    Baseline,
    Ensemble,
}

/// Weights for the six baseline scoring factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_w_urgency")]
    pub urgency: f64,
    #[serde(default = "default_w_importance")]
    pub importance: f64,
    #[serde(default = "default_w_effort")]
    pub effort: f64,
    #[serde(default = "default_w_freshness")]
    pub freshness: f64,
    #[serde(default = "default_w_sla")]
    pub sla: f64,
    #[serde(default = "default_w_progress")]
    pub progress: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            urgency: default_w_urgency(),
            importance: default_w_importance(),
            effort: default_w_effort(),
            freshness: default_w_freshness(),
            sla: default_w_sla(),
            progress: default_w_progress(),
        }
    }
}

fn default_w_urgency() -> f64 {
    0.30
}

fn default_w_importance() -> f64 {
    0.25
}

fn default_w_effort() -> f64 {
    0.15
}

fn default_w_freshness() -> f64 {
    0.10
}

fn default_w_sla() -> f64 {
    0.15
}

fn default_w_progress() -> f64 {
    0.05
}

/// Scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub mode: ScoringMode,

    #[serde(default)]
    pub weights: ScoringWeights,

    /// Deadline horizon beyond which urgency is zero (default: two weeks).
    #[serde(default = "default_urgency_horizon_hours")]
    pub urgency_horizon_hours: f64,

    /// Effort above this cap contributes nothing to the small-win preference.
    #[serde(default = "default_effort_cap_hours")]
    pub effort_cap_hours: f64,

    /// Decay constant for the freshness factor.
    #[serde(default = "default_freshness_tau_hours")]
    pub freshness_tau_hours: f64,

    /// Ensemble combination weights: [baseline, fuzzy, history].
    #[serde(default = "default_ensemble_weights")]
    pub ensemble_weights: [f64; 3],
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mode: ScoringMode::default(),
            weights: ScoringWeights::default(),
            urgency_horizon_hours: default_urgency_horizon_hours(),
            effort_cap_hours: default_effort_cap_hours(),
            freshness_tau_hours: default_freshness_tau_hours(),
            ensemble_weights: default_ensemble_weights(),
        }
    }
}

fn default_urgency_horizon_hours() -> f64 {
    336.0
}

fn default_effort_cap_hours() -> f64 {
    8.0
}

fn default_freshness_tau_hours() -> f64 {
    72.0
}

fn default_ensemble_weights() -> [f64; 3] {
    [0.40, 0.35, 0.25]
}

/// Outbox delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Rows claimed per worker tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retry budget before a row is dead-lettered (clamped to 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter fraction applied to the backoff (± this share of the delay).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Inflight lease; expired leases are reclaimed to pending.
    #[serde(default = "default_inflight_lease_seconds")]
    pub inflight_lease_seconds: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: default_jitter(),
            inflight_lease_seconds: default_inflight_lease_seconds(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_max_retries() -> i32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_inflight_lease_seconds() -> u64 {
    60
}

/// Periodic job cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_outbox_tick_ms")]
    pub outbox_tick_ms: u64,

    #[serde(default = "default_rescore_interval_s")]
    pub rescore_interval_s: u64,

    /// Tasks with no activity for this long are flagged and nudged.
    #[serde(default = "default_stale_threshold_hours")]
    pub stale_threshold_hours: f64,

    #[serde(default = "default_nudge_interval_s")]
    pub nudge_interval_s: u64,

    /// Retention for the seen-delivery ledger.
    #[serde(default = "default_ledger_ttl_days")]
    pub ledger_ttl_days: u32,

    /// Periodic rebalance cadence; 0 disables it (rebalance stays
    /// on-demand via the HTTP surface).
    #[serde(default)]
    pub rebalance_interval_s: u64,

    /// Available hours fed to the periodic rebalance.
    #[serde(default = "default_rebalance_hours")]
    pub rebalance_hours: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            outbox_tick_ms: default_outbox_tick_ms(),
            rescore_interval_s: default_rescore_interval_s(),
            stale_threshold_hours: default_stale_threshold_hours(),
            nudge_interval_s: default_nudge_interval_s(),
            ledger_ttl_days: default_ledger_ttl_days(),
            rebalance_interval_s: 0,
            rebalance_hours: default_rebalance_hours(),
        }
    }
}

fn default_rebalance_hours() -> f64 {
    5.0
}

fn default_outbox_tick_ms() -> u64 {
    1_000
}

fn default_rescore_interval_s() -> u64 {
    300
}

fn default_stale_threshold_hours() -> f64 {
    72.0
}

fn default_nudge_interval_s() -> u64 {
    3_600
}

fn default_ledger_ttl_days() -> u32 {
    30
}

/// Per-client service rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_sla_hours")]
    pub sla_hours: f64,

    #[serde(default = "default_daily_capacity_hours")]
    pub daily_capacity_hours: f64,

    /// Multiplicative bias applied to importance during default fill.
    #[serde(default = "default_importance_bias")]
    pub importance_bias: f64,

    /// Share of recent effort this client should receive (fairness target).
    #[serde(default = "default_target_share")]
    pub target_share: f64,

    /// Hours-to-deadline below which the fuzzy scorer treats work as urgent.
    /// Feeds the ensemble path only.
    #[serde(default = "default_urgency_threshold")]
    pub urgency_threshold: f64,

    /// Preferred complexity band for the fuzzy scorer ("simple", "moderate",
    /// "complex"). Feeds the ensemble path only.
    #[serde(default = "default_complexity_preference")]
    pub complexity_preference: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sla_hours: default_sla_hours(),
            daily_capacity_hours: default_daily_capacity_hours(),
            importance_bias: default_importance_bias(),
            target_share: default_target_share(),
            urgency_threshold: default_urgency_threshold(),
            complexity_preference: default_complexity_preference(),
        }
    }
}

fn default_sla_hours() -> f64 {
    72.0
}

fn default_daily_capacity_hours() -> f64 {
    2.0
}

fn default_importance_bias() -> f64 {
    1.0
}

fn default_target_share() -> f64 {
    0.2
}

fn default_urgency_threshold() -> f64 {
    24.0
}

fn default_complexity_preference() -> String {
    "moderate".to_string()
}

/// Per-task-type rules: defaults, labels, templates, classifier keywords.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTypeConfig {
    #[serde(default = "default_type_effort")]
    pub default_effort_hours: f64,

    #[serde(default = "default_type_importance")]
    pub default_importance: i32,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Checklist template; `{client}` and `{title}` are substituted.
    #[serde(default)]
    pub checklist_template: Vec<String>,

    /// Subtask template; `{client}` and `{title}` are substituted.
    #[serde(default)]
    pub subtasks_template: Vec<String>,

    /// Keywords matched against title + description during classification.
    #[serde(default)]
    pub classify_keywords: Vec<String>,
}

fn default_type_effort() -> f64 {
    2.0
}

fn default_type_importance() -> i32 {
    3
}

/// Webhook signature scheme identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureKind {
    #[default]
    HmacSha256Hex,
    HmacSha1Hex,
    HmacSha256Base64,
}

/// One configured backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,

    /// Inline token; prefer `token_env` outside of tests.
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default)]
    pub signature: SignatureKind,

    /// Header carrying the webhook signature.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Inline webhook secret; prefer `webhook_secret_env` outside of tests.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default)]
    pub webhook_secret_env: Option<String>,

    /// Token bucket: sustained requests per second.
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: f64,

    /// Token bucket: burst capacity.
    #[serde(default = "default_rate_burst")]
    pub rate_burst: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            token_env: None,
            signature: SignatureKind::default(),
            signature_header: default_signature_header(),
            webhook_secret: None,
            webhook_secret_env: None,
            rate_per_sec: default_rate_per_sec(),
            rate_burst: default_rate_burst(),
        }
    }
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_rate_per_sec() -> f64 {
    5.0
}

fn default_rate_burst() -> f64 {
    10.0
}

impl BackendConfig {
    /// Resolve the API token, preferring the environment reference.
    pub fn resolve_token(&self) -> String {
        self.token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.token.clone())
            .unwrap_or_default()
    }

    /// Resolve the webhook secret, preferring the environment reference.
    pub fn resolve_webhook_secret(&self) -> String {
        self.webhook_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.webhook_secret.clone())
            .unwrap_or_default()
    }
}

/// Advisor adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: String,

    #[serde(default = "default_advisor_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before the breaker trips.
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,

    /// Cool-down before a tripped breaker half-opens.
    #[serde(default = "default_breaker_cooldown_s")]
    pub breaker_cooldown_s: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            timeout_ms: default_advisor_timeout_ms(),
            breaker_failures: default_breaker_failures(),
            breaker_cooldown_s: default_breaker_cooldown_s(),
        }
    }
}

fn default_advisor_timeout_ms() -> u64 {
    20_000
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_cooldown_s() -> u64 {
    60
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub outbox: OutboxConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default = "Config::default_clients")]
    pub clients: HashMap<String, ClientConfig>,

    #[serde(default = "Config::default_task_types")]
    pub task_types: HashMap<String, TaskTypeConfig>,

    /// Classification order: first type in this list wins a keyword-count tie.
    #[serde(default = "Config::default_classify_order")]
    pub classify_order: Vec<String>,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub advisor: AdvisorConfig,
}

impl Config {
    /// Built-in task types mirroring the stock rule set.
    pub fn default_task_types() -> HashMap<String, TaskTypeConfig> {
        let mut types = HashMap::new();

        types.insert(
            "bugfix".to_string(),
            TaskTypeConfig {
                default_effort_hours: 2.0,
                default_importance: 4,
                labels: vec!["bug".to_string()],
                checklist_template: vec![
                    "Reproduce the issue for {client}".to_string(),
                    "Identify root cause".to_string(),
                    "Write regression test".to_string(),
                    "Deploy fix".to_string(),
                ],
                subtasks_template: vec![
                    "Investigate: {title}".to_string(),
                    "Fix and verify: {title}".to_string(),
                ],
                classify_keywords: vec![
                    "fix", "error", "fail", "bug", "500", "broken", "crash",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
        );

        types.insert(
            "report".to_string(),
            TaskTypeConfig {
                default_effort_hours: 3.0,
                default_importance: 3,
                labels: vec!["report".to_string()],
                checklist_template: vec![
                    "Gather data for {client}".to_string(),
                    "Draft report".to_string(),
                    "Review with stakeholder".to_string(),
                ],
                subtasks_template: vec!["Compile data: {title}".to_string()],
                classify_keywords: vec![
                    "report", "analysis", "dashboard", "metrics", "data",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
        );

        types.insert(
            "onboarding".to_string(),
            TaskTypeConfig {
                default_effort_hours: 4.0,
                default_importance: 3,
                labels: vec!["onboarding".to_string()],
                checklist_template: vec![
                    "Provision access for {client}".to_string(),
                    "Walk through setup".to_string(),
                    "Confirm sign-off".to_string(),
                ],
                subtasks_template: vec!["Prepare environment: {title}".to_string()],
                classify_keywords: vec![
                    "setup",
                    "onboard",
                    "access",
                    "provision",
                    "install",
                    "configure",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
        );

        types.insert("general".to_string(), TaskTypeConfig::default());

        types
    }

    pub fn default_classify_order() -> Vec<String> {
        vec![
            "bugfix".to_string(),
            "report".to_string(),
            "onboarding".to_string(),
            "general".to_string(),
        ]
    }

    pub fn default_clients() -> HashMap<String, ClientConfig> {
        let mut clients = HashMap::new();
        clients.insert("unknown".to_string(), ClientConfig::default());
        clients
    }

    /// Rules for one client, falling back to defaults for unknown tags.
    pub fn client(&self, tag: &str) -> ClientConfig {
        self.clients.get(tag).cloned().unwrap_or_default()
    }

    /// Rules for one task type, falling back to defaults for unknown types.
    pub fn task_type(&self, name: &str) -> TaskTypeConfig {
        self.task_types.get(name).cloned().unwrap_or_default()
    }

    /// Validate invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<()> {
        let w = &self.scoring.weights;
        let sum = w.urgency + w.importance + w.effort + w.freshness + w.sla + w.progress;
        if (sum - 1.0).abs() > 0.01 {
            return Err(anyhow!("scoring weights must sum to 1.0, got {:.3}", sum));
        }

        if self.scoring.urgency_horizon_hours <= 0.0 {
            return Err(anyhow!("urgency_horizon_hours must be positive"));
        }
        if self.scoring.effort_cap_hours <= 0.0 {
            return Err(anyhow!("effort_cap_hours must be positive"));
        }
        if self.scoring.freshness_tau_hours <= 0.0 {
            return Err(anyhow!("freshness_tau_hours must be positive"));
        }

        let esum: f64 = self.scoring.ensemble_weights.iter().sum();
        if (esum - 1.0).abs() > 0.01 {
            return Err(anyhow!("ensemble weights must sum to 1.0, got {:.3}", esum));
        }

        if self.outbox.max_retries < 1 || self.outbox.max_retries > 10 {
            return Err(anyhow!("outbox.max_retries must be in 1..=10"));
        }
        if !(0.0..=1.0).contains(&self.outbox.jitter) {
            return Err(anyhow!("outbox.jitter must be in [0, 1]"));
        }

        for (tag, client) in &self.clients {
            if client.sla_hours <= 0.0 {
                return Err(anyhow!("client {}: sla_hours must be positive", tag));
            }
            if client.daily_capacity_hours <= 0.0 {
                return Err(anyhow!(
                    "client {}: daily_capacity_hours must be positive",
                    tag
                ));
            }
        }

        Ok(())
    }
}
