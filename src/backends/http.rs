//! Generic HTTP backend adapter.
//!
//! Wire formats differ per vendor; this adapter speaks a plain JSON-over-REST
//! shape and relies on the capability interface for everything the core
//! needs. The idempotency key rides on every mutating request as an
//! `Idempotency-Key` header.

use super::{Backend, DispatchOutcome, SignatureScheme};
use crate::config::BackendConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpBackend {
    name: String,
    base_url: String,
    token: String,
    signature: SignatureScheme,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(name: String, config: &BackendConfig) -> Self {
        Self {
            name,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.resolve_token(),
            signature: SignatureScheme::from_config(config),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        let url = format!("{}{}", self.base_url, path);

        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Idempotency-Key", idempotency_key)
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return DispatchOutcome::Retryable {
                    status: None,
                    retry_after: None,
                    message: format!("transport error: {}", e),
                };
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = response.text().await.unwrap_or_default();
        let external_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .and_then(|id| match id {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        match DispatchOutcome::from_status(status, external_id, &body) {
            DispatchOutcome::Retryable {
                status, message, ..
            } => DispatchOutcome::Retryable {
                status,
                retry_after,
                message,
            },
            other => other,
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &SignatureScheme {
        &self.signature
    }

    async fn create_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.post("/tasks", payload, idempotency_key).await
    }

    async fn add_subtask(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.post("/subtasks", payload, idempotency_key).await
    }

    async fn add_checklist_item(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.post("/checklist", payload, idempotency_key).await
    }

    async fn update_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.post("/tasks/update", payload, idempotency_key).await
    }

    async fn notify(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome {
        self.post("/notifications", payload, idempotency_key).await
    }

    async fn list_tasks(&self) -> Result<Vec<Value>> {
        let url = format!("{}/tasks", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("list_tasks failed: HTTP {}", response.status()));
        }

        let body: Value = response.json().await?;
        match body {
            Value::Array(items) => Ok(items),
            Value::Object(mut map) => match map.remove("tasks") {
                Some(Value::Array(items)) => Ok(items),
                _ => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn create_webhook(&self, callback_url: &str) -> DispatchOutcome {
        let payload = serde_json::json!({ "url": callback_url });
        self.post("/webhooks", &payload, callback_url).await
    }
}
