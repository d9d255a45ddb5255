//! In-process stub backend for tests.
//!
//! Outcomes can be scripted per call; without a script every mutating call
//! succeeds with a generated external id. The stub keeps the key ↔
//! external-id memo the capability contract requires, so replaying a key
//! produces no second effect.

use super::{Backend, DispatchOutcome, SignatureScheme};
use crate::config::SignatureKind;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: String,
    pub idempotency_key: String,
    pub payload: Value,
}

pub struct StubBackend {
    name: String,
    signature: SignatureScheme,
    scripted: Mutex<Vec<DispatchOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    memo: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
}

impl StubBackend {
    pub fn new(name: impl Into<String>, secret: &str) -> Self {
        Self {
            name: name.into(),
            signature: SignatureScheme::new(SignatureKind::HmacSha256Hex, "x-signature", secret),
            scripted: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            memo: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Queue outcomes for upcoming calls (consumed in order).
    pub fn script(&self, outcomes: Vec<DispatchOutcome>) {
        let mut scripted = self.scripted.lock().unwrap();
        *scripted = outcomes;
        scripted.reverse();
    }

    /// All calls that produced an effect attempt, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of *effects* produced (successful, non-deduplicated calls).
    pub fn effect_count(&self) -> usize {
        self.memo.lock().unwrap().len()
    }

    fn execute(&self, operation: &str, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.calls.lock().unwrap().push(RecordedCall {
            operation: operation.to_string(),
            idempotency_key: idempotency_key.to_string(),
            payload: payload.clone(),
        });

        // A key already delivered short-circuits: same external id, no new
        // effect, regardless of any script.
        {
            let memo = self.memo.lock().unwrap();
            if let Some(external_id) = memo.get(idempotency_key) {
                return DispatchOutcome::Success {
                    external_id: Some(external_id.clone()),
                };
            }
        }

        let outcome = self
            .scripted
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(DispatchOutcome::Success { external_id: None });

        match outcome {
            DispatchOutcome::Success { external_id } => {
                let external_id = external_id.unwrap_or_else(|| {
                    format!("ext_{}", self.counter.fetch_add(1, Ordering::SeqCst))
                });
                self.memo
                    .lock()
                    .unwrap()
                    .insert(idempotency_key.to_string(), external_id.clone());
                DispatchOutcome::Success {
                    external_id: Some(external_id),
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &SignatureScheme {
        &self.signature
    }

    async fn create_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.execute("create_task", payload, idempotency_key)
    }

    async fn add_subtask(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.execute("add_subtask", payload, idempotency_key)
    }

    async fn add_checklist_item(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.execute("add_checklist_item", payload, idempotency_key)
    }

    async fn update_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.execute("update_task", payload, idempotency_key)
    }

    async fn notify(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.execute("notify", payload, idempotency_key)
    }

    async fn list_tasks(&self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}
