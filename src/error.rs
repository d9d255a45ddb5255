//! Structured error types for the orchestration core.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (rejected locally, never retried)
    InvariantViolation,
    MissingRequiredField,
    InvalidFieldValue,

    // Not found errors
    TaskNotFound,
    MappingNotFound,
    OutboxRowNotFound,

    // Webhook intake
    SignatureFailure,
    Duplicate,

    // Delivery classification
    Transient,
    Permanent,
    LeaseExpired,

    // Advisor
    AdvisorUnavailable,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Structured error carried through handlers and workers.
#[derive(Debug, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn mapping_not_found(backend: &str, external_id: &str) -> Self {
        Self::new(
            ErrorCode::MappingNotFound,
            format!("No mapping for {}/{}", backend, external_id),
        )
    }

    pub fn outbox_row_not_found(id: i64) -> Self {
        Self::new(
            ErrorCode::OutboxRowNotFound,
            format!("Outbox row not found: {}", id),
        )
    }

    pub fn signature_failure(backend: &str) -> Self {
        Self::new(
            ErrorCode::SignatureFailure,
            format!("Webhook signature verification failed for {}", backend),
        )
    }

    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::Duplicate, what)
    }

    pub fn advisor_unavailable(reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::AdvisorUnavailable,
            format!("Advisor unavailable: {}", reason),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(err) => AppError::database(err),
        }
    }
}

/// Result type for operations that surface structured errors.
pub type AppResult<T> = std::result::Result<T, AppError>;
