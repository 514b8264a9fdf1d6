//! Stage 4: credit evaluation.
//!
//! Validates the phone number, then serves from the 5-minute result cache
//! or calls the external scorer. Scorer failures are returned to the caller
//! and never cached; there is no retry here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::{Outcome, Stage};
use crate::cache::{Cached, TtlCache};
use crate::error::StageError;
use crate::events::PipelineEvent;
use crate::external::{CreditScorer, with_timeout};
use crate::model::{CREDIT_CACHE_TTL, CreditCheckResult, CreditDecision, CreditStatus, PhoneNumber};
use crate::stages::StageContext;

pub struct CreditEvaluator {
    ctx: StageContext,
    scorer: Arc<dyn CreditScorer>,
    cache: TtlCache<PhoneNumber, CreditCheckResult>,
    timeout: Duration,
}

impl CreditEvaluator {
    pub fn new(ctx: StageContext, scorer: Arc<dyn CreditScorer>, timeout: Duration) -> Self {
        let cache = TtlCache::new(CREDIT_CACHE_TTL, Arc::clone(&ctx.clock));
        Self {
            ctx,
            scorer,
            cache,
            timeout,
        }
    }

    /// Score `phone` for `visitor_id`, emitting `CreditApproved` or
    /// `CreditDeclined`.
    pub async fn evaluate(
        &self,
        phone: &str,
        visitor_id: Uuid,
    ) -> Result<CreditCheckResult, StageError> {
        let phone = match PhoneNumber::parse(phone) {
            Ok(p) => p,
            Err(e) => {
                self.record_failure(visitor_id, "validation", &e.to_string()).await;
                return Err(e.into());
            }
        };

        let (scorer, clock, timeout, key) = (&self.scorer, &self.ctx.clock, self.timeout, &phone);
        let lookup = self
            .cache
            .get_or_try_compute(phone.clone(), || async move {
                let response = with_timeout("scorer", timeout, scorer.score(key)).await?;
                Ok::<_, StageError>(CreditCheckResult::from_response(
                    key.clone(),
                    response,
                    clock.now(),
                ))
            })
            .await;

        let Cached { value: result, hit } = match lookup {
            Ok(cached) => cached,
            Err(e) => {
                warn!(visitor_id = %visitor_id, phone = %phone, error = %e, "Credit scorer call failed");
                self.record_failure(visitor_id, e.kind(), &e.to_string()).await;
                return Err(e);
            }
        };
        if hit {
            debug!(visitor_id = %visitor_id, phone = %phone, "Credit result served from cache");
        }

        self.apply_to_visitor(visitor_id, &phone, &result).await?;

        info!(
            visitor_id = %visitor_id,
            approved = result.approved(),
            score = result.score,
            cache_hit = hit,
            "Credit evaluated"
        );
        self.ctx
            .activity
            .record(
                Stage::CreditEvaluator,
                "evaluate",
                visitor_id.to_string(),
                Outcome::Success,
                json!({
                    "credit_check_id": result.id,
                    "approved": result.approved(),
                    "score": result.score,
                    "cache_hit": hit,
                    "reasons": match &result.decision {
                        CreditDecision::Declined { reasons } => reasons.clone(),
                        CreditDecision::Approved { .. } => Vec::new(),
                    },
                }),
            )
            .await;

        let event = if result.approved() {
            PipelineEvent::CreditApproved {
                visitor_id,
                result: result.clone(),
            }
        } else {
            PipelineEvent::CreditDeclined {
                visitor_id,
                result: result.clone(),
            }
        };
        self.ctx.emit(event).await;

        Ok(result)
    }

    /// Release cache slots for results past their TTL. Returns how many.
    pub async fn purge_cache(&self) -> usize {
        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Expired credit results purged");
        }
        purged
    }

    /// Phone numbers currently holding a cache slot.
    pub async fn cache_slots(&self) -> usize {
        self.cache.slot_count().await
    }

    async fn apply_to_visitor(
        &self,
        visitor_id: Uuid,
        phone: &PhoneNumber,
        result: &CreditCheckResult,
    ) -> Result<(), StageError> {
        let now = self.ctx.clock.now();
        let status = if result.approved() {
            CreditStatus::Approved
        } else {
            CreditStatus::Declined
        };
        self.ctx
            .modify_visitor(visitor_id, |visitor| {
                visitor.credit_status = Some(status);
                if visitor.phone_number.is_none() {
                    visitor.phone_number = Some(phone.clone());
                }
                visitor.updated_at = now;
                Some(())
            })
            .await?;
        Ok(())
    }

    async fn record_failure(&self, visitor_id: Uuid, kind: &str, detail: &str) {
        self.ctx
            .activity
            .record(
                Stage::CreditEvaluator,
                "evaluate",
                visitor_id.to_string(),
                Outcome::Failure,
                json!({ "error": kind, "detail": detail }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::activity::AuditSink;
    use crate::clock::Clock;
    use crate::error::{ExternalError, ValidationError};
    use crate::events::EventKind;
    use crate::model::{EmailHash, ScoreResponse, Visitor};
    use crate::stages::testing::{Harness, StubScorer, harness};
    use crate::store::PipelineStore;

    async fn visitor(h: &Harness, email: &str) -> Uuid {
        let v = Visitor::new(EmailHash::from_email(email).unwrap(), "s1", 3, h.clock.now());
        h.store.insert_visitor_if_absent(&v).await.unwrap();
        v.id
    }

    fn evaluator(h: &Harness, scorer: Arc<StubScorer>) -> CreditEvaluator {
        CreditEvaluator::new(h.ctx.clone(), scorer, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn invalid_phone_never_reaches_scorer() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let scorer = Arc::new(StubScorer::approving());

        let err = evaluator(&h, scorer.clone()).evaluate("555-12", id).await.unwrap_err();
        assert!(matches!(err, StageError::Validation(ValidationError::InvalidPhone)));
        assert_eq!(scorer.calls(), 0);
        let records = h.store.records_for(&id.to_string()).await.unwrap();
        assert_eq!(records[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn approval_updates_visitor_and_emits() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let mut sub = h.ctx.bus.subscribe(&[EventKind::CreditApproved]).await;
        let evaluator = evaluator(&h, Arc::new(StubScorer::approving()));

        let result = evaluator.evaluate("(555) 123-4567", id).await.unwrap();
        assert!(result.approved());
        assert_eq!(result.score, 710);
        assert_eq!(result.phone.as_str(), "+15551234567");

        let stored = h.store.get_visitor(id).await.unwrap().unwrap();
        assert_eq!(stored.credit_status, Some(CreditStatus::Approved));
        assert!(matches!(
            sub.try_recv().unwrap().event,
            PipelineEvent::CreditApproved { .. }
        ));
    }

    #[tokio::test]
    async fn cache_serves_until_ttl_boundary() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let scorer = Arc::new(StubScorer::approving());
        let evaluator = evaluator(&h, scorer.clone());

        let first = evaluator.evaluate("5551234567", id).await.unwrap();
        h.clock.advance(ChronoDuration::minutes(5) - ChronoDuration::seconds(1));
        let second = evaluator.evaluate("+1 555 123 4567", id).await.unwrap();
        assert_eq!(scorer.calls(), 1);
        assert_eq!(first.id, second.id);

        h.clock.advance(ChronoDuration::seconds(2));
        let third = evaluator.evaluate("5551234567", id).await.unwrap();
        assert_eq!(scorer.calls(), 2);
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn decline_emits_reasons() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let mut sub = h.ctx.bus.subscribe(&[EventKind::CreditDeclined]).await;
        let scorer = Arc::new(StubScorer::with(Ok(ScoreResponse {
            approved: false,
            score: 520,
            approved_amount: None,
            rate: None,
            reasons: vec!["score_below_threshold".into()],
        })));

        let result = evaluator(&h, scorer).evaluate("5551234567", id).await.unwrap();
        assert!(!result.approved());
        match sub.try_recv().unwrap().event {
            PipelineEvent::CreditDeclined { result, .. } => assert_eq!(
                result.decision,
                CreditDecision::Declined {
                    reasons: vec!["score_below_threshold".into()]
                }
            ),
            other => panic!("unexpected event {other:?}"),
        }
        let stored = h.store.get_visitor(id).await.unwrap().unwrap();
        assert_eq!(stored.credit_status, Some(CreditStatus::Declined));
    }

    #[tokio::test]
    async fn scorer_failure_is_recoverable_and_not_cached() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let scorer = Arc::new(StubScorer::with(Err(ExternalError::transient("scorer", "503"))));
        let evaluator = evaluator(&h, scorer.clone());

        let err = evaluator.evaluate("5551234567", id).await.unwrap_err();
        assert!(err.is_retryable());

        *scorer.response.lock().unwrap() = StubScorer::approving().response.into_inner().unwrap();
        let result = evaluator.evaluate("5551234567", id).await.unwrap();
        assert!(result.approved());
        assert_eq!(scorer.calls(), 2);
    }

    #[tokio::test]
    async fn purge_cache_drops_expired_results() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let scorer = Arc::new(StubScorer::approving());
        let evaluator = evaluator(&h, scorer.clone());

        evaluator.evaluate("5551234567", id).await.unwrap();
        evaluator.evaluate("5559876543", id).await.unwrap();
        assert_eq!(evaluator.purge_cache().await, 0);

        h.clock.advance(ChronoDuration::minutes(6));
        assert_eq!(evaluator.purge_cache().await, 2);
        assert_eq!(evaluator.cache_slots().await, 0);

        evaluator.evaluate("5551234567", id).await.unwrap();
        assert_eq!(scorer.calls(), 3);
    }

    #[tokio::test]
    async fn stalled_scorer_times_out() {
        let h = harness();
        let id = visitor(&h, "a@b.com").await;
        let mut scorer = StubScorer::approving();
        scorer.delay = Duration::from_secs(10);
        let evaluator = CreditEvaluator::new(h.ctx.clone(), Arc::new(scorer), Duration::from_millis(20));

        let err = evaluator.evaluate("5551234567", id).await.unwrap_err();
        assert!(matches!(err, StageError::External(ExternalError::Timeout { .. })));
        assert!(err.is_retryable());
    }
}
