//! Stage 2: re-engagement dispatch.
//!
//! Issues a single-use return token and sends the visitor a message that
//! links back into their session. Repeated dispatches for the same
//! abandonment step reuse the live token instead of minting a new one, so
//! the 24-hour window is never extended.
//!
//! Only the dispatcher holding the token's send claim talks to the sender.
//! The claim is released when a send fails and lapses after twice the send
//! timeout, so a crashed dispatcher never blocks the step for good.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{Outcome, Stage};
use crate::error::{StageError, StoreError, ValidationError};
use crate::events::PipelineEvent;
use crate::external::{MessageSender, with_timeout};
use crate::model::ReturnToken;
use crate::stages::{StageContext, lease_cutoff};

/// What the caller gets back from a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    /// False when an earlier dispatch already delivered this token.
    pub newly_sent: bool,
}

pub struct Dispatcher {
    ctx: StageContext,
    sender: Arc<dyn MessageSender>,
    return_base_url: String,
    timeout: Duration,
}

/// Subject and body for an abandonment step. Pure lookup.
pub fn render_message(step: u32, return_url: &str) -> (String, String) {
    let (subject, lead_in) = match step {
        0..=2 => (
            "You're almost there",
            "You started your auto loan application but didn't get to finish.",
        ),
        3 => (
            "Your vehicle financing is waiting",
            "You've already told us about the vehicle you want. Just a few details left.",
        ),
        4 => (
            "One step from your offer",
            "You're one step away from seeing your personalized financing offer.",
        ),
        _ => (
            "Pick up right where you left off",
            "Your application is nearly complete and we've saved your progress.",
        ),
    };
    let body = format!(
        "{lead_in}\n\nContinue here: {return_url}\n\nThis link works once and expires in 24 hours."
    );
    (subject.to_string(), body)
}

impl Dispatcher {
    pub fn new(
        ctx: StageContext,
        sender: Arc<dyn MessageSender>,
        return_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            sender,
            return_base_url: return_base_url.into(),
            timeout,
        }
    }

    fn return_url(&self, token: &str) -> String {
        let sep = if self.return_base_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}token={token}", self.return_base_url)
    }

    /// Issue (or reuse) the visitor's return token and send the message.
    ///
    /// On send failure the token stays valid and the error is returned; the
    /// caller decides whether to dispatch again.
    pub async fn dispatch(&self, visitor_id: Uuid) -> Result<DispatchReceipt, StageError> {
        let visitor = self
            .ctx
            .store
            .get_visitor(visitor_id)
            .await?
            .ok_or_else(|| StoreError::not_found("visitor", visitor_id))?;
        let now = self.ctx.clock.now();
        let step = visitor.abandonment_step;

        let (token, issued) = self
            .ctx
            .store
            .issue_token_if_none_live(&ReturnToken::issue(visitor_id, step, now), now)
            .await?;
        if issued {
            info!(
                visitor_id = %visitor_id,
                token = token.fingerprint(),
                expires_at = %token.expires_at,
                "Return token issued"
            );
        } else {
            debug!(visitor_id = %visitor_id, token = token.fingerprint(), "Reusing live return token");
        }

        if token.message_sent {
            return Ok(self.skipped(visitor_id, token, "already_sent").await);
        }

        let stale_before = lease_cutoff(now, self.timeout.saturating_mul(2));
        if !self.ctx.store.claim_dispatch(&token.value, now, stale_before).await? {
            let reason = match self.ctx.store.live_token_for(visitor_id, step, now).await? {
                Some(current) if current.message_sent => "already_sent",
                _ => "send_in_progress",
            };
            return Ok(self.skipped(visitor_id, token, reason).await);
        }

        let address = match self.ctx.store.get_contact(visitor_id).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                self.release(&token).await;
                let e = ValidationError::NoContactAddress(visitor_id);
                self.record_failure(visitor_id, &token, "validation", &e.to_string()).await;
                return Err(e.into());
            }
            Err(e) => {
                self.release(&token).await;
                return Err(e.into());
            }
        };

        let (subject, body) = render_message(step, &self.return_url(&token.value));
        let receipt = match with_timeout(
            "email",
            self.timeout,
            self.sender.send(&address, &subject, &body),
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(visitor_id = %visitor_id, error = %e, "Re-engagement send failed");
                self.release(&token).await;
                let kind = if e.is_retryable() { "transient_external" } else { "terminal_external" };
                self.record_failure(visitor_id, &token, kind, &e.to_string()).await;
                return Err(e.into());
            }
        };

        self.ctx.store.mark_message_sent(&token.value).await?;
        self.ctx
            .activity
            .record(
                Stage::ReengagementDispatcher,
                "dispatch",
                visitor_id.to_string(),
                Outcome::Success,
                json!({
                    "token": token.fingerprint(),
                    "step": step,
                    "provider_message_id": receipt.provider_message_id,
                }),
            )
            .await;
        self.ctx
            .emit(PipelineEvent::MessageSent {
                visitor_id,
                provider_message_id: receipt.provider_message_id.clone(),
                token_expires_at: token.expires_at,
            })
            .await;

        Ok(DispatchReceipt {
            token: token.value,
            expires_at: token.expires_at,
            provider_message_id: receipt.provider_message_id,
            newly_sent: true,
        })
    }

    async fn skipped(&self, visitor_id: Uuid, token: ReturnToken, reason: &str) -> DispatchReceipt {
        debug!(visitor_id = %visitor_id, token = token.fingerprint(), reason, "Dispatch skipped");
        self.ctx
            .activity
            .record(
                Stage::ReengagementDispatcher,
                "dispatch",
                visitor_id.to_string(),
                Outcome::Skipped,
                json!({ "reason": reason, "token": token.fingerprint(), "step": token.abandonment_step }),
            )
            .await;
        DispatchReceipt {
            token: token.value,
            expires_at: token.expires_at,
            provider_message_id: None,
            newly_sent: false,
        }
    }

    async fn release(&self, token: &ReturnToken) {
        if let Err(e) = self.ctx.store.release_dispatch(&token.value).await {
            warn!(token = token.fingerprint(), error = %e, "Failed to release dispatch claim; it will lapse");
        }
    }

    async fn record_failure(&self, visitor_id: Uuid, token: &ReturnToken, kind: &str, detail: &str) {
        self.ctx
            .activity
            .record(
                Stage::ReengagementDispatcher,
                "dispatch",
                visitor_id.to_string(),
                Outcome::Failure,
                json!({ "error": kind, "detail": detail, "token": token.fingerprint() }),
            )
            .await;
    }
}
