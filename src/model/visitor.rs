//! Visitor record and the email digest that anchors its identity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::PhoneNumber;

/// Irreversible SHA-256 digest of a normalised email address (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailHash(String);

impl EmailHash {
    /// Hash a raw address. The plaintext is not retained.
    pub fn from_email(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_lowercase();
        let Some((local, domain)) = normalized.split_once('@') else {
            return Err(ValidationError::InvalidEmail);
        };
        if local.is_empty() || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(ValidationError::InvalidEmail);
        }
        let digest = Sha256::digest(normalized.as_bytes());
        Ok(Self(format!("{:x}", digest)))
    }

    /// Accept a digest computed upstream.
    pub fn from_hex(hex: &str) -> Result<Self, ValidationError> {
        let hex = hex.trim().to_lowercase();
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(hex))
        } else {
            Err(ValidationError::InvalidEmail)
        }
    }

    /// Accept either a raw email or an already-computed digest.
    pub fn from_email_or_hash(input: &str) -> Result<Self, ValidationError> {
        if input.contains('@') {
            Self::from_email(input)
        } else {
            Self::from_hex(input)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EmailHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix only; enough to correlate logs.
        write!(f, "{}…", &self.0[..self.0.len().min(12)])
    }
}

/// Outcome of the most recent credit check recorded on a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Approved,
    Declined,
}

/// Identity anchor for a prospective customer.
///
/// At most one exists per [`EmailHash`]. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    pub id: Uuid,
    pub email_hash: EmailHash,
    pub session_id: String,
    pub last_activity_at: DateTime<Utc>,
    /// Ordinal funnel position. The latest observation wins.
    pub abandonment_step: u32,
    pub abandoned: bool,
    /// Set only after the visitor discloses it in chat.
    pub phone_number: Option<PhoneNumber>,
    /// Whitelisted engagement keys only.
    pub metadata: BTreeMap<String, String>,
    pub credit_status: Option<CreditStatus>,
    /// Step for which `LeadReady` was last emitted.
    pub lead_ready_step: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every write. An update carrying a stale
    /// version is rejected.
    #[serde(default)]
    pub version: u64,
}

impl Visitor {
    pub fn new(email_hash: EmailHash, session_id: impl Into<String>, step: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_hash,
            session_id: session_id.into(),
            last_activity_at: at,
            abandonment_step: step,
            abandoned: false,
            phone_number: None,
            metadata: BTreeMap::new(),
            credit_status: None,
            lead_ready_step: None,
            created_at: at,
            updated_at: at,
            version: 0,
        }
    }

    /// Whether this visitor meaningfully engaged before leaving.
    ///
    /// A step-1 bounce never qualifies.
    pub fn qualifies_for_reengagement(&self) -> bool {
        self.abandoned && self.abandonment_step >= 2 && !self.metadata.is_empty()
    }
}
