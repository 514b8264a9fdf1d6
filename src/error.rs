//! Error types for the lead pipeline.

use std::time::Duration;

use uuid::Uuid;

use crate::model::LeadStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Redemption error: {0}")]
    Redeem(#[from] RedeemError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Malformed input. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Invalid phone number")]
    InvalidPhone,

    #[error("Invalid abandonment step: {0}")]
    InvalidStep(i64),

    #[error("No contact address on file for visitor {0}")]
    NoContactAddress(Uuid),

    #[error("Credit check {0} was not approved")]
    NotApproved(Uuid),

    #[error("Visitor {0} has not resumed their session")]
    SessionNotResumed(Uuid),
}

/// Failure of an outbound call to an external capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExternalError {
    /// 5xx-class or connection failure.
    #[error("{capability} transient failure: {reason}")]
    Transient { capability: String, reason: String },

    #[error("{capability} timed out after {timeout:?}")]
    Timeout {
        capability: String,
        timeout: Duration,
    },

    /// 4xx-class or explicit rejection.
    #[error("{capability} rejected the request (status {status:?}): {reason}")]
    Terminal {
        capability: String,
        status: Option<u16>,
        reason: String,
    },
}

impl ExternalError {
    pub fn transient(capability: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            capability: capability.to_string(),
            reason: reason.into(),
        }
    }

    pub fn terminal(capability: &str, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Terminal {
            capability: capability.to_string(),
            status,
            reason: reason.into(),
        }
    }

    /// Timeouts are treated exactly like 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Why a return token could not be redeemed.
#[derive(Debug, thiserror::Error)]
pub enum RedeemError {
    #[error("Return token not found")]
    NotFound,

    #[error("Return token expired")]
    Expired,

    #[error("Return token already used")]
    AlreadyUsed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RedeemError {
    /// The only text that may cross the visitor-facing boundary.
    pub fn user_message(&self) -> &'static str {
        "This link is no longer valid. Please try again."
    }
}

/// Errors surfaced by pipeline stage operations.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("External call failed: {0}")]
    External(#[from] ExternalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lead {lead_id} cannot move from {from} to {to}")]
    Transition {
        lead_id: Uuid,
        from: LeadStatus,
        to: LeadStatus,
    },
}

impl StageError {
    /// Whether the caller may re-invoke the operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::External(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short label for activity records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::External(e) if e.is_retryable() => "transient_external",
            Self::External(_) => "terminal_external",
            Self::Store(_) => "store",
            Self::Transition { .. } => "transition",
        }
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
