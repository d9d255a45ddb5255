//! Advisor adapter: an optional remote refinement service whose suggestions
//! are merged conservatively by the triage pipeline.
//!
//! The adapter only transports snapshots and suggestions; the allow-list
//! enforcement lives in `triage::merge_suggestion`.

use crate::config::AdvisorConfig;
use crate::types::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// The fields an advisor is shown; nothing else leaves the process.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub client: String,
    pub deadline: Option<i64>,
    pub importance: i32,
    pub labels: Vec<String>,
    pub subtasks: Vec<String>,
}

impl Snapshot {
    pub fn of(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            task_type: task.task_type.clone(),
            client: task.client.clone(),
            deadline: task.deadline,
            importance: task.importance,
            labels: task.labels.clone(),
            subtasks: task.subtasks.clone(),
        }
    }
}

/// Allow-listed suggestion delta. Fields outside this shape never reach the
/// merge step: identity, status, deadline, and external bindings are not
/// representable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<String>,
    #[serde(default)]
    pub score_override: Option<f64>,
    #[serde(default)]
    pub hold_creation: bool,
}

/// Why a refinement did not produce a suggestion.
#[derive(Debug)]
pub enum AdvisorError {
    /// Breaker open, timeout, transport failure, or non-2xx response.
    Unavailable(String),
}

impl fmt::Display for AdvisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvisorError::Unavailable(reason) => write!(f, "{}", reason),
        }
    }
}

/// The advisor capability.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn refine(&self, snapshot: &Snapshot) -> Result<Suggestion, AdvisorError>;
}

/// Consecutive-failure breaker with a cool-down half-open.
struct Breaker {
    failures: AtomicU32,
    last_failure_ms: AtomicU64,
    max_failures: u32,
    cooldown_ms: u64,
}

impl Breaker {
    fn new(max_failures: u32, cooldown_ms: u64) -> Self {
        Self {
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            max_failures: max_failures.max(1),
            cooldown_ms,
        }
    }

    fn is_open(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.max_failures {
            return false;
        }
        let last = self.last_failure_ms.load(Ordering::Relaxed);
        let now = crate::db::now_ms() as u64;
        now.saturating_sub(last) < self.cooldown_ms
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(crate::db::now_ms() as u64, Ordering::Relaxed);
    }
}

/// HTTP advisor adapter with a bounded timeout and the breaker.
pub struct HttpAdvisor {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    breaker: Breaker,
}

impl HttpAdvisor {
    pub fn new(config: &AdvisorConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            client: reqwest::Client::new(),
            breaker: Breaker::new(
                config.breaker_failures,
                config.breaker_cooldown_s * 1000,
            ),
        }
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn refine(&self, snapshot: &Snapshot) -> Result<Suggestion, AdvisorError> {
        if self.breaker.is_open() {
            debug!("advisor breaker open; using deterministic result");
            return Err(AdvisorError::Unavailable("circuit breaker open".into()));
        }

        let result = self
            .client
            .post(&self.url)
            .json(snapshot)
            .timeout(self.timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                warn!("advisor request failed: {}", e);
                return Err(AdvisorError::Unavailable(e.to_string()));
            }
        };

        if !response.status().is_success() {
            self.breaker.record_failure();
            return Err(AdvisorError::Unavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        match response.json::<Suggestion>().await {
            Ok(suggestion) => {
                self.breaker.record_success();
                Ok(suggestion)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(AdvisorError::Unavailable(format!("bad response: {}", e)))
            }
        }
    }
}

/// In-process stub for tests: returns the scripted suggestion, or
/// unavailable when scripted with None.
pub struct StubAdvisor {
    responses: Mutex<Vec<Option<Suggestion>>>,
}

impl StubAdvisor {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn with_suggestion(suggestion: Suggestion) -> Self {
        let stub = Self::new();
        stub.script(vec![Some(suggestion)]);
        stub
    }

    pub fn unavailable() -> Self {
        let stub = Self::new();
        stub.script(vec![None]);
        stub
    }

    pub fn script(&self, responses: Vec<Option<Suggestion>>) {
        let mut scripted = self.responses.lock().unwrap();
        *scripted = responses;
        scripted.reverse();
    }
}

impl Default for StubAdvisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Advisor for StubAdvisor {
    async fn refine(&self, _snapshot: &Snapshot) -> Result<Suggestion, AdvisorError> {
        match self.responses.lock().unwrap().pop() {
            Some(Some(suggestion)) => Ok(suggestion),
            Some(None) | None => Err(AdvisorError::Unavailable("stubbed offline".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_after_threshold_and_half_opens() {
        let breaker = Breaker::new(3, 60_000);
        assert!(!breaker.is_open());

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());

        // A success closes it again.
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn breaker_half_opens_after_cooldown() {
        let breaker = Breaker::new(1, 0);
        breaker.record_failure();
        // Zero cooldown: immediately half-open.
        assert!(!breaker.is_open());
    }

    #[test]
    fn snapshot_carries_only_advice_fields() {
        let json = serde_json::to_value(Snapshot {
            title: "t".into(),
            description: "d".into(),
            task_type: "general".into(),
            client: "acme".into(),
            deadline: None,
            importance: 3,
            labels: vec![],
            subtasks: vec![],
        })
        .unwrap();

        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert!(!keys.contains(&"id"));
        assert!(!keys.contains(&"status"));
        assert!(!keys.contains(&"score"));
    }
}
