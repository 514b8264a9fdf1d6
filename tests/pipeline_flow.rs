//! End-to-end pipeline tests.
//!
//! Real stages, bus and runner over the in-memory store; only the three
//! external capabilities are stubbed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::time::timeout;

use lead_pipeline::activity::{AuditSink, Outcome};
use lead_pipeline::clock::{Clock, SystemClock};
use lead_pipeline::error::{ExternalError, RedeemError};
use lead_pipeline::events::{EventBus, EventKind, PipelineEvent, Subscription};
use lead_pipeline::external::{
    CreditScorer, CrmResponse, CrmSubmitter, MessageSender, SendReceipt,
};
use lead_pipeline::model::{EmailHash, LeadStatus, PhoneNumber, ScoreResponse};
use lead_pipeline::pipeline::{PipelineRunner, RunnerHandle};
use lead_pipeline::stages::{
    AbandonmentDetector, AbandonmentSignal, ChatOutcome, CreditEvaluator, Dispatcher,
    LeadSubmitter, RetryPolicy, SessionRecovery, StageContext,
};
use lead_pipeline::store::{MemoryStore, PipelineStore};

/// Maximum time any wait is allowed before we consider the pipeline hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Stub capabilities ───────────────────────────────────────────────────

#[derive(Default)]
struct CountingSender {
    sent: AtomicUsize,
}

#[async_trait]
impl MessageSender for CountingSender {
    async fn send(&self, _address: &str, _subject: &str, body: &str) -> Result<SendReceipt, ExternalError> {
        assert!(body.contains("token="));
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            provider_message_id: Some(format!("stub-{n}")),
        })
    }
}

#[derive(Default)]
struct ApprovingScorer {
    calls: AtomicUsize,
}

#[async_trait]
impl CreditScorer for ApprovingScorer {
    async fn score(&self, _phone: &PhoneNumber) -> Result<ScoreResponse, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScoreResponse {
            approved: true,
            score: 710,
            approved_amount: Some(dec!(18000)),
            rate: Some(dec!(6.25)),
            reasons: vec![],
        })
    }
}

/// Always answers with the same status.
struct FixedCrm {
    status: u16,
    calls: AtomicUsize,
}

impl FixedCrm {
    fn new(status: u16) -> Self {
        Self {
            status,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CrmSubmitter for FixedCrm {
    async fn submit(&self, payload: &serde_json::Value) -> Result<CrmResponse, ExternalError> {
        assert!(payload["lead"]["credit"]["score"].is_number());
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CrmResponse {
            status_code: self.status,
            body: format!(r#"{{"reference":"CRM-{n}"}}"#),
        })
    }
}

// ── Wiring ──────────────────────────────────────────────────────────────

struct Pipeline {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    detector: AbandonmentDetector,
    recovery: SessionRecovery,
    sender: Arc<CountingSender>,
    scorer: Arc<ApprovingScorer>,
    crm: Arc<FixedCrm>,
    _runner: RunnerHandle,
}

async fn start_pipeline(crm_status: u16) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ctx = StageContext::new(store.clone(), store.clone(), Arc::clone(&bus), clock);

    let sender = Arc::new(CountingSender::default());
    let scorer = Arc::new(ApprovingScorer::default());
    let crm = Arc::new(FixedCrm::new(crm_status));

    let dispatcher = Arc::new(Dispatcher::new(
        ctx.clone(),
        sender.clone(),
        "https://loans.example/return",
        Duration::from_secs(1),
    ));
    let credit = Arc::new(CreditEvaluator::new(ctx.clone(), scorer.clone(), Duration::from_secs(1)));
    let submitter = Arc::new(LeadSubmitter::new(
        ctx.clone(),
        crm.clone(),
        RetryPolicy::new(3, Duration::from_millis(1)),
        Duration::from_secs(1),
    ));
    let runner = PipelineRunner::new(Arc::clone(&bus), dispatcher, credit, submitter)
        .start()
        .await;

    Pipeline {
        store,
        bus,
        detector: AbandonmentDetector::new(
            ctx.clone(),
            ["vehicle_type".to_string(), "loan_amount".to_string()],
            Duration::from_secs(30 * 60),
        )
        .unwrap(),
        recovery: SessionRecovery::new(ctx),
        sender,
        scorer,
        crm,
        _runner: runner,
    }
}

fn signal(email: &str, step: i64) -> AbandonmentSignal {
    AbandonmentSignal {
        session_id: Some("s1".into()),
        email: Some(email.into()),
        step: Some(step),
        abandoned: true,
        metadata: BTreeMap::from([
            ("vehicle_type".to_string(), "suv".to_string()),
            ("referrer_ip".to_string(), "10.0.0.1".to_string()),
        ]),
        observed_at: None,
    }
}

async fn next_event(sub: &mut Subscription) -> PipelineEvent {
    timeout(TEST_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for pipeline event")
        .expect("event bus closed")
        .event
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandonment_to_dead_letter() {
    let p = start_pipeline(500).await;
    let mut sent = p.bus.subscribe(&[EventKind::MessageSent]).await;
    let mut dead = p.bus.subscribe(&[EventKind::LeadDeadLettered]).await;

    // Stage 1: abandon at step 3.
    let visitor = p.detector.detect(signal("a@b.com", 3)).await.unwrap();
    assert_eq!(visitor.email_hash, EmailHash::from_email("a@b.com").unwrap());
    assert!(!visitor.metadata.contains_key("referrer_ip"));

    // Stage 2 runs off LeadReady.
    match next_event(&mut sent).await {
        PipelineEvent::MessageSent { visitor_id, .. } => assert_eq!(visitor_id, visitor.id),
        other => panic!("unexpected event {other:?}"),
    }
    let token = p.store.latest_token_for(visitor.id).await.unwrap().unwrap();
    assert!(token.message_sent);
    assert_eq!(token.expires_at - token.issued_at, chrono::Duration::hours(24));

    // Stage 3: return and give a phone number.
    let resumed = p.recovery.redeem(&token.value).await.unwrap();
    assert_eq!(resumed.id, visitor.id);
    assert!(matches!(
        p.recovery.redeem(&token.value).await,
        Err(RedeemError::AlreadyUsed)
    ));
    let outcome = p
        .recovery
        .handle_message(visitor.id, "you can reach me at 555-123-4567")
        .await
        .unwrap();
    assert!(matches!(outcome, ChatOutcome::CreditCheckRequested { .. }));

    // Stages 4 and 5 run off CreditCheckRequested / CreditApproved.
    let lead_id = match next_event(&mut dead).await {
        PipelineEvent::LeadDeadLettered { lead_id, visitor_id, .. } => {
            assert_eq!(visitor_id, visitor.id);
            lead_id
        }
        other => panic!("unexpected event {other:?}"),
    };

    assert_eq!(p.sender.sent.load(Ordering::SeqCst), 1);
    assert_eq!(p.scorer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.crm.calls.load(Ordering::SeqCst), 3);

    let lead = p.store.get_lead(lead_id).await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::DeadLettered);
    assert_eq!(lead.data.visitor.phone.as_ref().unwrap().as_str(), "+15551234567");
    assert_eq!(lead.data.credit.score, 710);
    assert!(lead.data.engagement.message_sent);

    let dead_letters = p.store.unresolved_dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].attempts, 3);

    let trail = p.store.records_for(&lead_id.to_string()).await.unwrap();
    assert_eq!(trail.last().unwrap().outcome, Outcome::Failure);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_signals_keep_one_visitor_and_one_message() {
    let p = start_pipeline(201).await;
    let mut sent = p.bus.subscribe(&[EventKind::MessageSent]).await;

    let first = p.detector.detect(signal("a@b.com", 3)).await.unwrap();
    next_event(&mut sent).await;
    for _ in 0..3 {
        let again = p.detector.detect(signal("A@B.com ", 3)).await.unwrap();
        assert_eq!(again.id, first.id);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.store.visitor_count().await, 1);
    assert_eq!(p.sender.sent.load(Ordering::SeqCst), 1);
    assert!(sent.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivered_approval_submits_once() {
    let p = start_pipeline(201).await;
    let mut sent = p.bus.subscribe(&[EventKind::MessageSent]).await;
    let mut submitted = p.bus.subscribe(&[EventKind::LeadSubmitted]).await;
    let mut approved = p.bus.subscribe(&[EventKind::CreditApproved]).await;

    let visitor = p.detector.detect(signal("c@d.com", 4)).await.unwrap();
    next_event(&mut sent).await;
    let token = p.store.latest_token_for(visitor.id).await.unwrap().unwrap();
    p.recovery.redeem(&token.value).await.unwrap();

    p.recovery.handle_message(visitor.id, "(555) 123-4567").await.unwrap();
    let reference = match next_event(&mut submitted).await {
        PipelineEvent::LeadSubmitted { reference, .. } => reference,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(reference, "CRM-1");

    // Same number again inside the cache window: cached approval, same
    // credit check id, so the existing lead is found and not resubmitted.
    p.recovery.handle_message(visitor.id, "it's 555 123 4567").await.unwrap();
    next_event(&mut approved).await;
    next_event(&mut approved).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(p.scorer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.crm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.store.leads_with_status(LeadStatus::Submitted).await.unwrap().len(), 1);
    assert!(submitted.try_recv().is_none());
}
