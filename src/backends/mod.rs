//! Backend capability interface: the contract every third-party task
//! backend adapter implements, plus webhook signature verification and
//! per-backend rate limiting.

mod http;
mod stub;

pub use http::HttpBackend;
pub use stub::StubBackend;

use crate::config::{BackendConfig, SignatureKind};
use crate::types::{
    OutboxRow, OP_ADD_CHECKLIST_ITEM, OP_ADD_SUBTASK, OP_CREATE_TASK, OP_NOTIFY, OP_UPDATE_TASK,
};
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Classified result of one backend call.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// 2xx; carries the created object's external id when the backend
    /// returned one.
    Success { external_id: Option<String> },
    /// 408/425/429/5xx or a transport failure; worth another attempt.
    /// `retry_after` carries a Retry-After hint in seconds.
    Retryable {
        status: Option<u16>,
        retry_after: Option<u64>,
        message: String,
    },
    /// Remaining 4xx; retrying cannot help.
    Permanent { status: u16, message: String },
}

impl DispatchOutcome {
    /// Classify an HTTP status the way the outbox retry policy expects.
    pub fn from_status(status: u16, external_id: Option<String>, body: &str) -> Self {
        match status {
            200..=299 => DispatchOutcome::Success { external_id },
            408 | 425 | 429 | 500..=599 => DispatchOutcome::Retryable {
                status: Some(status),
                retry_after: None,
                message: format!("HTTP {}", status),
            },
            _ => DispatchOutcome::Permanent {
                status,
                message: format!("HTTP {}: {}", status, truncate(body, 200)),
            },
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() > max {
        &s[..max]
    } else {
        s
    }
}

/// Webhook signature scheme: a keyed hash over the raw body, carried in a
/// backend-specific header.
#[derive(Debug, Clone)]
pub struct SignatureScheme {
    pub kind: SignatureKind,
    pub header: String,
    secret: String,
}

impl SignatureScheme {
    pub fn new(kind: SignatureKind, header: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind,
            header: header.into(),
            secret: secret.into(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.signature,
            config.signature_header.clone(),
            config.resolve_webhook_secret(),
        )
    }

    /// Verify a provided signature against the raw body.
    ///
    /// The comparison is constant time (`Mac::verify_slice`); decoding
    /// failures and length mismatches verify as false, never as errors.
    pub fn verify(&self, raw_body: &[u8], provided: &str) -> bool {
        let provided = provided.trim();
        if provided.is_empty() || self.secret.is_empty() {
            return false;
        }

        match self.kind {
            SignatureKind::HmacSha256Hex => {
                let Ok(sig) = hex::decode(provided) else {
                    return false;
                };
                let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()) else {
                    return false;
                };
                mac.update(raw_body);
                mac.verify_slice(&sig).is_ok()
            }
            SignatureKind::HmacSha1Hex => {
                let Ok(sig) = hex::decode(provided) else {
                    return false;
                };
                let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(self.secret.as_bytes()) else {
                    return false;
                };
                mac.update(raw_body);
                mac.verify_slice(&sig).is_ok()
            }
            SignatureKind::HmacSha256Base64 => {
                let Ok(sig) = base64::engine::general_purpose::STANDARD.decode(provided) else {
                    return false;
                };
                let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()) else {
                    return false;
                };
                mac.update(raw_body);
                mac.verify_slice(&sig).is_ok()
            }
        }
    }

    /// Produce a signature for a body (test fixtures, outgoing webhooks).
    pub fn sign(&self, raw_body: &[u8]) -> String {
        match self.kind {
            SignatureKind::HmacSha256Hex => {
                let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
                    .expect("HMAC accepts any key length");
                mac.update(raw_body);
                hex::encode(mac.finalize().into_bytes())
            }
            SignatureKind::HmacSha1Hex => {
                let mut mac = Hmac::<Sha1>::new_from_slice(self.secret.as_bytes())
                    .expect("HMAC accepts any key length");
                mac.update(raw_body);
                hex::encode(mac.finalize().into_bytes())
            }
            SignatureKind::HmacSha256Base64 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
                    .expect("HMAC accepts any key length");
                mac.update(raw_body);
                base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
            }
        }
    }
}

/// The capability contract a backend adapter implements.
///
/// Every mutating operation accepts the caller's idempotency key and must
/// propagate it; an adapter for a backend with no native support keeps a
/// local key ↔ external-id memo to short-circuit duplicates.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn signature(&self) -> &SignatureScheme;

    async fn create_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome;

    async fn add_subtask(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome;

    async fn add_checklist_item(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome;

    async fn update_task(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome;

    /// Deliver a notification (stale nudges). Backends without a native
    /// notification channel may treat this as a comment/update.
    async fn notify(&self, payload: &Value, idempotency_key: &str) -> DispatchOutcome;

    async fn list_tasks(&self) -> Result<Vec<Value>>;

    /// Register a webhook callback; optional.
    async fn create_webhook(&self, _callback_url: &str) -> DispatchOutcome {
        DispatchOutcome::Permanent {
            status: 404,
            message: "webhook registration not supported".to_string(),
        }
    }

    /// Verify an inbound webhook against this backend's signature scheme.
    fn verify_webhook(&self, raw_body: &[u8], provided: &str) -> bool {
        self.signature().verify(raw_body, provided)
    }

    /// Route an outbox row to the matching capability.
    async fn dispatch(&self, row: &OutboxRow) -> DispatchOutcome {
        match row.operation.as_str() {
            OP_CREATE_TASK => self.create_task(&row.payload, &row.idempotency_key).await,
            OP_ADD_SUBTASK => self.add_subtask(&row.payload, &row.idempotency_key).await,
            OP_ADD_CHECKLIST_ITEM => {
                self.add_checklist_item(&row.payload, &row.idempotency_key)
                    .await
            }
            OP_UPDATE_TASK => self.update_task(&row.payload, &row.idempotency_key).await,
            OP_NOTIFY => self.notify(&row.payload, &row.idempotency_key).await,
            other => DispatchOutcome::Permanent {
                status: 400,
                message: format!("unknown operation: {}", other),
            },
        }
    }
}

/// Token bucket limiter, one per backend.
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.01),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill_ms: crate::db::now_ms(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait_ms = {
                let mut state = self.state.lock().await;
                let now = crate::db::now_ms();
                let elapsed_s = (now - state.last_refill_ms).max(0) as f64 / 1000.0;
                state.tokens =
                    (state.tokens + elapsed_s * self.refill_per_sec).min(self.capacity);
                state.last_refill_ms = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                ((1.0 - state.tokens) / self.refill_per_sec * 1000.0).ceil() as u64
            };
            tokio::time::sleep(Duration::from_millis(wait_ms.max(10))).await;
        }
    }
}

/// Configured backends plus their rate limiters.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            limiters: HashMap::new(),
        }
    }

    /// Build HTTP backends from configuration.
    pub fn from_config(configs: &HashMap<String, BackendConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in configs {
            let backend = HttpBackend::new(name.clone(), config);
            registry.register(
                Arc::new(backend),
                RateLimiter::new(config.rate_burst, config.rate_per_sec),
            );
        }
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>, limiter: RateLimiter) {
        let name = backend.name().to_string();
        self.limiters.insert(name.clone(), Arc::new(limiter));
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn limiter(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_round_trip_verifies() {
        let scheme = SignatureScheme::new(SignatureKind::HmacSha256Hex, "x-signature", "s3cret");
        let body = br#"{"event":"taskUpdated"}"#;

        let sig = scheme.sign(body);
        assert!(scheme.verify(body, &sig));
        assert!(!scheme.verify(b"tampered", &sig));
        assert!(!scheme.verify(body, "deadbeef"));
        assert!(!scheme.verify(body, "not-hex!"));
    }

    #[test]
    fn sha1_hex_round_trip_verifies() {
        let scheme = SignatureScheme::new(SignatureKind::HmacSha1Hex, "x-hook", "s3cret");
        let body = b"payload";

        let sig = scheme.sign(body);
        assert_eq!(sig.len(), 40);
        assert!(scheme.verify(body, &sig));
    }

    #[test]
    fn sha256_base64_round_trip_verifies() {
        let scheme =
            SignatureScheme::new(SignatureKind::HmacSha256Base64, "x-hmac", "another-secret");
        let body = b"payload";

        let sig = scheme.sign(body);
        assert!(scheme.verify(body, &sig));
        assert!(!scheme.verify(body, "AAAA"));
    }

    #[test]
    fn empty_secret_never_verifies() {
        let scheme = SignatureScheme::new(SignatureKind::HmacSha256Hex, "x-signature", "");
        assert!(!scheme.verify(b"body", "00"));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            DispatchOutcome::from_status(201, Some("e1".into()), ""),
            DispatchOutcome::Success { .. }
        ));
        assert!(matches!(
            DispatchOutcome::from_status(503, None, ""),
            DispatchOutcome::Retryable { .. }
        ));
        assert!(matches!(
            DispatchOutcome::from_status(429, None, ""),
            DispatchOutcome::Retryable { .. }
        ));
        assert!(matches!(
            DispatchOutcome::from_status(404, None, ""),
            DispatchOutcome::Permanent { .. }
        ));
        assert!(matches!(
            DispatchOutcome::from_status(409, None, ""),
            DispatchOutcome::Permanent { .. }
        ));
    }
}
