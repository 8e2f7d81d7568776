//! Error types for the early warning core.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{DeliveryChannel, Language, MessageStatus};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<crate::models::ParseEnumError> for StoreError {
    fn from(err: crate::models::ParseEnumError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// One rejected field of a rule configuration update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid rule configuration: {}", format_violations(.violations))]
    InvalidConfig { violations: Vec<FieldViolation> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.field, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("student not found: {0}")]
    StudentNotFound(Uuid),

    #[error("detection task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found in any language: {template_id}")]
    NotFound { template_id: String },

    #[error("template {template_id} ({language}) has unresolved placeholder {placeholder}")]
    Render {
        template_id: String,
        language: Language,
        placeholder: String,
    },

    #[error("template catalog could not be loaded: {0}")]
    Catalog(String),
}

/// Errors raised at the channel provider boundary.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("provider call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl ProviderError {
    /// Transient failures and timeouts share the retry path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("illegal status transition {from} -> {to} for message {message_id} ({channel})")]
    InvalidTransition {
        message_id: Uuid,
        channel: DeliveryChannel,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("no sub-delivery {channel} for message {message_id}")]
    UnknownDelivery {
        message_id: Uuid,
        channel: DeliveryChannel,
    },

    #[error("no delivery with provider message id {0}")]
    UnknownProviderMessage(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("recipient {recipient} has no contact method for the requested channel")]
    NoContactMethod { recipient: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("delivery task failed: {0}")]
    Task(String),
}

/// Environment configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}")]
    Malformed { key: &'static str, value: String },

    #[error("{key} {message}")]
    Invalid {
        key: &'static str,
        message: &'static str,
    },
}
