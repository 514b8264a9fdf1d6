//! Stage 3: session recovery and chat handling.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{Outcome, Stage};
use crate::error::{RedeemError, StageError, ValidationError};
use crate::events::PipelineEvent;
use crate::model::{PhoneNumber, Visitor};
use crate::stages::StageContext;

/// Result of handling one inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatOutcome {
    /// No contact number found; the conversation carries on.
    Continue,
    /// A number was found and a credit check was requested.
    CreditCheckRequested { phone: String },
}

pub struct SessionRecovery {
    ctx: StageContext,
}

impl SessionRecovery {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    /// Redeem a return token and resume the visitor's session.
    ///
    /// Single use: the store flips `used` atomically, so concurrent
    /// redemptions of one token produce exactly one success.
    pub async fn redeem(&self, token: &str) -> Result<Visitor, RedeemError> {
        let now = self.ctx.clock.now();
        let fingerprint: String = token.chars().take(8).collect();
        let fingerprint = fingerprint.as_str();

        let redeemed = match self.ctx.store.redeem_token(token, now).await {
            Ok(t) => t,
            Err(e) => {
                let reason = match &e {
                    RedeemError::NotFound => "not_found",
                    RedeemError::Expired => "expired",
                    RedeemError::AlreadyUsed => "already_used",
                    RedeemError::Store(_) => "store",
                };
                warn!(token = fingerprint, reason, "Return token rejected");
                self.ctx
                    .activity
                    .record(
                        Stage::SessionRecovery,
                        "redeem_token",
                        fingerprint,
                        Outcome::Failure,
                        json!({ "reason": reason }),
                    )
                    .await;
                return Err(e);
            }
        };

        let (visitor, _) = self
            .ctx
            .modify_visitor(redeemed.visitor_id, |visitor| {
                visitor.last_activity_at = now;
                visitor.abandoned = false;
                visitor.updated_at = now;
                Some(())
            })
            .await?;

        info!(visitor_id = %visitor.id, token = fingerprint, "Session resumed from return token");
        self.ctx
            .activity
            .record(
                Stage::SessionRecovery,
                "redeem_token",
                visitor.id.to_string(),
                Outcome::Success,
                json!({ "token": fingerprint, "step": redeemed.abandonment_step }),
            )
            .await;
        Ok(visitor)
    }

    /// Find a contact number in free text, normalised to E.164.
    pub fn extract_contact(text: &str) -> Option<PhoneNumber> {
        PhoneNumber::extract(text)
    }

    /// Process one chat message from a resumed visitor. A message without a
    /// phone number is not an error.
    ///
    /// A visitor still marked abandoned has not come back through a return
    /// link (or a fresh signal), so the message is refused and nothing is
    /// written.
    pub async fn handle_message(
        &self,
        visitor_id: Uuid,
        text: &str,
    ) -> Result<ChatOutcome, StageError> {
        let now = self.ctx.clock.now();
        let found = Self::extract_contact(text);

        let (_, resumed) = self
            .ctx
            .modify_visitor(visitor_id, |visitor| {
                if visitor.abandoned {
                    return None;
                }
                visitor.last_activity_at = now;
                visitor.updated_at = now;
                if let Some(phone) = &found {
                    visitor.phone_number = Some(phone.clone());
                }
                Some(())
            })
            .await?;
        if resumed.is_none() {
            warn!(visitor_id = %visitor_id, "Chat message from visitor without a resumed session");
            self.ctx
                .activity
                .record(
                    Stage::SessionRecovery,
                    "handle_message",
                    visitor_id.to_string(),
                    Outcome::Failure,
                    json!({ "error": "session_not_resumed" }),
                )
                .await;
            return Err(ValidationError::SessionNotResumed(visitor_id).into());
        }

        let Some(phone) = found else {
            debug!(visitor_id = %visitor_id, "No contact number in message");
            return Ok(ChatOutcome::Continue);
        };

        info!(visitor_id = %visitor_id, phone = %phone, "Contact number captured");
        self.ctx
            .activity
            .record(
                Stage::SessionRecovery,
                "extract_contact",
                visitor_id.to_string(),
                Outcome::Success,
                json!({ "phone": phone.masked() }),
            )
            .await;
        self.ctx
            .emit(PipelineEvent::CreditCheckRequested {
                visitor_id,
                phone: phone.clone(),
            })
            .await;

        Ok(ChatOutcome::CreditCheckRequested {
            phone: phone.masked(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::activity::AuditSink;
    use crate::clock::Clock;
    use crate::events::EventKind;
    use crate::model::{EmailHash, RETURN_TOKEN_TTL, ReturnToken};
    use crate::stages::testing::{Harness, harness};
    use crate::store::PipelineStore;

    async fn seeded(h: &Harness) -> (Visitor, ReturnToken) {
        let mut v = Visitor::new(EmailHash::from_email("a@b.com").unwrap(), "s1", 3, h.clock.now());
        v.abandoned = true;
        h.store.insert_visitor_if_absent(&v).await.unwrap();
        let token = ReturnToken::issue(v.id, 3, h.clock.now());
        h.store.insert_token(&token).await.unwrap();
        (v, token)
    }

    #[tokio::test]
    async fn redeem_resumes_session_once() {
        let h = harness();
        let (v, token) = seeded(&h).await;
        let recovery = SessionRecovery::new(h.ctx.clone());

        h.clock.advance(Duration::hours(1));
        let resumed = recovery.redeem(&token.value).await.unwrap();
        assert_eq!(resumed.id, v.id);
        assert!(!resumed.abandoned);
        assert_eq!(resumed.last_activity_at, h.clock.now());

        assert!(matches!(
            recovery.redeem(&token.value).await,
            Err(RedeemError::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn redeem_one_second_after_expiry_fails() {
        let h = harness();
        let (_, token) = seeded(&h).await;
        let recovery = SessionRecovery::new(h.ctx.clone());

        h.clock.advance(RETURN_TOKEN_TTL + Duration::seconds(1));
        assert!(matches!(
            recovery.redeem(&token.value).await,
            Err(RedeemError::Expired)
        ));

        let records = h.store.records_for(&token.value[..8]).await.unwrap();
        assert_eq!(records[0].metadata["reason"], "expired");
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let h = harness();
        let recovery = SessionRecovery::new(h.ctx.clone());
        assert!(matches!(recovery.redeem("deadbeef").await, Err(RedeemError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemptions_have_single_winner() {
        let h = harness();
        let (_, token) = seeded(&h).await;
        let recovery = Arc::new(SessionRecovery::new(h.ctx.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let recovery = Arc::clone(&recovery);
                let value = token.value.clone();
                tokio::spawn(async move { recovery.redeem(&value).await })
            })
            .collect();

        let mut ok = 0;
        let mut used = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RedeemError::AlreadyUsed) => used += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, used), (1, 15));
    }

    #[tokio::test]
    async fn phone_in_chat_requests_credit_check() {
        let h = harness();
        let (v, token) = seeded(&h).await;
        let mut sub = h.ctx.bus.subscribe(&[EventKind::CreditCheckRequested]).await;
        let recovery = SessionRecovery::new(h.ctx.clone());
        recovery.redeem(&token.value).await.unwrap();

        let outcome = recovery
            .handle_message(v.id, "sure, it's (555) 123-4567")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChatOutcome::CreditCheckRequested {
                phone: "***4567".into()
            }
        );

        let stored = h.store.get_visitor(v.id).await.unwrap().unwrap();
        assert_eq!(stored.phone_number.unwrap().as_str(), "+15551234567");
        match sub.try_recv().unwrap().event {
            PipelineEvent::CreditCheckRequested { phone, .. } => {
                assert_eq!(phone.as_str(), "+15551234567")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_without_phone_just_continues() {
        let h = harness();
        let (v, token) = seeded(&h).await;
        let mut sub = h.ctx.bus.subscribe(&[EventKind::CreditCheckRequested]).await;
        let recovery = SessionRecovery::new(h.ctx.clone());
        recovery.redeem(&token.value).await.unwrap();

        let outcome = recovery
            .handle_message(v.id, "I'd like about 15000 for a used truck")
            .await
            .unwrap();
        assert_eq!(outcome, ChatOutcome::Continue);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn chat_before_resume_is_refused() {
        let h = harness();
        let (v, token) = seeded(&h).await;
        let mut sub = h.ctx.bus.subscribe(&[EventKind::CreditCheckRequested]).await;
        let recovery = SessionRecovery::new(h.ctx.clone());

        let err = recovery
            .handle_message(v.id, "sure, it's (555) 123-4567")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Validation(ValidationError::SessionNotResumed(id)) if id == v.id
        ));
        assert!(sub.try_recv().is_none());
        let stored = h.store.get_visitor(v.id).await.unwrap().unwrap();
        assert!(stored.phone_number.is_none());
        assert_eq!(stored.version, 0);
        let records = h.store.records_for(&v.id.to_string()).await.unwrap();
        assert_eq!(records.last().unwrap().outcome, Outcome::Failure);

        recovery.redeem(&token.value).await.unwrap();
        assert!(matches!(
            recovery.handle_message(v.id, "(555) 123-4567").await.unwrap(),
            ChatOutcome::CreditCheckRequested { .. }
        ));
    }
}
