//! Single-use return tokens.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifetime of a return token. A security boundary, never extended.
pub const RETURN_TOKEN_TTL: Duration = Duration::hours(24);

/// Bytes of entropy per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Capability granting one session continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnToken {
    /// 64 lowercase hex characters.
    pub value: String,
    pub visitor_id: Uuid,
    /// Abandonment step the token was issued for.
    pub abandonment_step: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    /// Whether the re-engagement message carrying this token went out.
    pub message_sent: bool,
    /// When a dispatcher took the right to send; cleared on failure.
    #[serde(default)]
    pub dispatch_claimed_at: Option<DateTime<Utc>>,
}

impl ReturnToken {
    /// Issue a fresh token from the OS CSPRNG.
    pub fn issue(visitor_id: Uuid, abandonment_step: u32, now: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            value,
            visitor_id,
            abandonment_step,
            issued_at: now,
            expires_at: now + RETURN_TOKEN_TTL,
            used: false,
            redeemed_at: None,
            message_sent: false,
            dispatch_claimed_at: None,
        }
    }

    /// Expired at or after `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Usable for a redemption at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired_at(now)
    }

    /// Short prefix for logs.
    pub fn fingerprint(&self) -> &str {
        &self.value[..8]
    }
}
