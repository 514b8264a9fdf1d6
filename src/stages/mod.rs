//! The five pipeline stages.
//!
//! Each stage is a plain service over a shared [`StageContext`]. Stages never
//! call each other: they publish events, and the runner in `pipeline` routes
//! those events to the next stage.

pub mod abandonment;
pub mod credit;
pub mod reengagement;
pub mod recovery;
pub mod retry;
pub mod submission;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::activity::{ActivityLog, AuditSink};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::events::{EventBus, PipelineEvent};
use crate::model::Visitor;
use crate::store::PipelineStore;

pub use abandonment::{AbandonmentDetector, AbandonmentSignal};
pub use credit::CreditEvaluator;
pub use reengagement::{DispatchReceipt, Dispatcher};
pub use recovery::{ChatOutcome, SessionRecovery};
pub use retry::{MAX_SUBMIT_ATTEMPTS, RetryPolicy};
pub use submission::{LeadSubmitter, ReprocessSummary, SubmissionOutcome};

/// Versioned visitor writes that lose a race are re-read and reapplied this
/// many times before the conflict is surfaced.
const VISITOR_WRITE_ATTEMPTS: usize = 8;

/// Claims taken at or before the returned instant are stale at `now`. A
/// lease too long to represent never goes stale.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Collaborators every stage shares.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn PipelineStore>,
    pub activity: ActivityLog,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

impl StageContext {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        audit: Arc<dyn AuditSink>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            activity: ActivityLog::new(audit, Arc::clone(&clock)),
            bus,
            clock,
        }
    }

    pub(crate) async fn emit(&self, event: PipelineEvent) {
        self.bus.publish(event).await;
    }

    /// Read-modify-write of a visitor against its stored version.
    ///
    /// `change` runs on a fresh copy each attempt and may run more than once.
    /// Returning `None` leaves the record untouched; the visitor handed back
    /// is then the one that was read.
    pub(crate) async fn modify_visitor<R>(
        &self,
        id: Uuid,
        mut change: impl FnMut(&mut Visitor) -> Option<R>,
    ) -> Result<(Visitor, Option<R>), StoreError> {
        let mut attempt = 1;
        loop {
            let mut visitor = self
                .store
                .get_visitor(id)
                .await?
                .ok_or_else(|| StoreError::not_found("visitor", id))?;
            let Some(result) = change(&mut visitor) else {
                return Ok((visitor, None));
            };
            match self.store.update_visitor(&visitor).await {
                Ok(stored) => return Ok((stored, Some(result))),
                Err(StoreError::Conflict(reason)) if attempt < VISITOR_WRITE_ATTEMPTS => {
                    debug!(visitor_id = %id, attempt, %reason, "Visitor changed underneath, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable capability doubles shared by the stage tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ExternalError;
    use crate::external::{CreditScorer, CrmResponse, CrmSubmitter, MessageSender, SendReceipt};
    use crate::model::{PhoneNumber, ScoreResponse};
    use crate::store::MemoryStore;

    pub struct Harness {
        pub ctx: StageContext,
        pub store: Arc<MemoryStore>,
        pub clock: Arc<ManualClock>,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = StageContext::new(store.clone(), store.clone(), EventBus::new(), clock.clone());
        Harness { ctx, store, clock }
    }

    #[derive(Default)]
    pub struct StubSender {
        pub sent: Mutex<Vec<(String, String, String)>>,
        pub fail: Mutex<Option<ExternalError>>,
        pub delay: Duration,
    }

    #[async_trait]
    impl MessageSender for StubSender {
        async fn send(
            &self,
            address: &str,
            subject: &str,
            body: &str,
        ) -> Result<SendReceipt, ExternalError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(e) = self.fail.lock().unwrap().clone() {
                return Err(e);
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((address.into(), subject.into(), body.into()));
            Ok(SendReceipt {
                provider_message_id: Some(format!("msg-{}", sent.len())),
            })
        }
    }

    pub struct StubScorer {
        pub calls: AtomicUsize,
        pub response: Mutex<Result<ScoreResponse, ExternalError>>,
        pub delay: Duration,
    }

    impl StubScorer {
        pub fn approving() -> Self {
            Self::with(Ok(ScoreResponse {
                approved: true,
                score: 710,
                approved_amount: Some(dec!(18000)),
                rate: Some(dec!(6.25)),
                reasons: vec![],
            }))
        }

        pub fn with(response: Result<ScoreResponse, ExternalError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(response),
                delay: Duration::ZERO,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CreditScorer for StubScorer {
        async fn score(&self, _phone: &PhoneNumber) -> Result<ScoreResponse, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.lock().unwrap().clone()
        }
    }

    /// Replays scripted statuses, then repeats the last one.
    pub struct StubCrm {
        pub calls: AtomicUsize,
        pub script: Mutex<VecDeque<u16>>,
        pub last: Mutex<u16>,
        pub delay: Duration,
    }

    impl StubCrm {
        pub fn scripted(statuses: &[u16]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(statuses.iter().copied().collect()),
                last: Mutex::new(statuses.last().copied().unwrap_or(200)),
                delay: Duration::ZERO,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CrmSubmitter for StubCrm {
        async fn submit(&self, _payload: &serde_json::Value) -> Result<CrmResponse, ExternalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let status = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(*self.last.lock().unwrap());
            Ok(CrmResponse {
                status_code: status,
                body: format!(r#"{{"reference":"CRM-{n}"}}"#),
            })
        }
    }
}
