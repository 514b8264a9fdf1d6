//! Stage 5: lead packaging and CRM submission.
//!
//! `submit` claims the lead with a compare-and-set to `processing` before
//! touching the CRM, so at most one delivery per lead is ever in flight.
//! Retryable failures (5xx, timeouts) are retried under the [`RetryPolicy`];
//! anything else stops immediately. Exhaustion dead-letters the lead.
//!
//! The claim is a lease. Every saved attempt refreshes `updated_at`, and a
//! `processing` lead whose `updated_at` is older than [`LeadSubmitter::lease`]
//! may be claimed again. A submit that is dropped or fails on a store error
//! hands the lead back as `failed` so it can be resubmitted.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activity::{Outcome, Stage};
use crate::clock::Clock;
use crate::error::{ExternalError, StageError, StoreError, ValidationError};
use crate::events::PipelineEvent;
use crate::external::{CrmSubmitter, with_timeout};
use crate::model::{CreditCheckResult, DeadLetterEntry, Lead, LeadSnapshot, LeadStatus};
use crate::stages::retry::RetryPolicy;
use crate::stages::{StageContext, lease_cutoff};
use crate::store::PipelineStore;

/// How a `submit` call ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Submitted { reference: String, attempts: u32 },
    /// 4xx or explicit rejection. The lead is `failed`.
    Rejected { status: Option<u16>, reason: String },
    /// Retries exhausted. The lead is `dead_lettered`.
    DeadLettered { error: String, attempts: u32 },
    /// Another caller holds the lead.
    InFlight,
    AlreadySubmitted { reference: Option<String> },
}

/// Totals from one dead-letter reprocessing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReprocessSummary {
    pub attempted: usize,
    pub submitted: usize,
    pub still_failing: usize,
}

/// Hands an interrupted claim back as `failed` unless settled.
struct Claim {
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    lead_id: Uuid,
    settled: bool,
}

impl Claim {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lead_id = %self.lead_id, "No runtime to release lead claim; it will lapse");
            return;
        };
        let store = Arc::clone(&self.store);
        let lead_id = self.lead_id;
        let now = self.clock.now();
        runtime.spawn(async move {
            match store
                .transition_lead(lead_id, &[LeadStatus::Processing], LeadStatus::Failed, now)
                .await
            {
                Ok(_) => warn!(lead_id = %lead_id, "Interrupted submission released; lead marked failed"),
                Err(StoreError::Conflict(_)) => {}
                Err(e) => error!(lead_id = %lead_id, error = %e, "Failed to release lead claim; it will lapse"),
            }
        });
    }
}

pub struct LeadSubmitter {
    ctx: StageContext,
    crm: Arc<dyn CrmSubmitter>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl LeadSubmitter {
    pub fn new(
        ctx: StageContext,
        crm: Arc<dyn CrmSubmitter>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            crm,
            policy,
            timeout,
        }
    }

    /// How long a `processing` claim may go without a saved attempt before
    /// another caller can take the lead over.
    pub fn lease(&self) -> Duration {
        self.timeout.saturating_add(self.policy.max_delay).saturating_mul(2)
    }

    // ── Packaging ───────────────────────────────────────────────────

    /// Freeze visitor, engagement and credit data into a pending Lead.
    ///
    /// Idempotent per `(visitor_id, credit.id)`: a redelivered approval
    /// returns the existing lead.
    pub async fn package(
        &self,
        visitor_id: Uuid,
        credit: &CreditCheckResult,
    ) -> Result<Lead, StageError> {
        if !credit.approved() {
            self.ctx
                .activity
                .record(
                    Stage::LeadSubmitter,
                    "package",
                    visitor_id.to_string(),
                    Outcome::Skipped,
                    json!({ "reason": "credit_declined", "credit_check_id": credit.id }),
                )
                .await;
            return Err(ValidationError::NotApproved(credit.id).into());
        }

        let visitor = self
            .ctx
            .store
            .get_visitor(visitor_id)
            .await?
            .ok_or_else(|| StoreError::not_found("visitor", visitor_id))?;
        let token = self.ctx.store.latest_token_for(visitor_id).await?;
        let snapshot =
            LeadSnapshot::assemble(&visitor, token.as_ref(), credit, self.ctx.clock.now())
                .ok_or(ValidationError::NotApproved(credit.id))?;

        let (lead, created) = self
            .ctx
            .store
            .insert_lead_if_absent(&Lead::new(snapshot))
            .await?;

        info!(lead_id = %lead.id, visitor_id = %visitor_id, created, "Lead packaged");
        self.ctx
            .activity
            .record(
                Stage::LeadSubmitter,
                "package",
                lead.id.to_string(),
                if created { Outcome::Success } else { Outcome::Skipped },
                json!({
                    "visitor_id": visitor_id,
                    "credit_check_id": credit.id,
                    "created": created,
                }),
            )
            .await;
        Ok(lead)
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Deliver a lead to the CRM with bounded retry.
    pub async fn submit(&self, lead_id: Uuid) -> Result<SubmissionOutcome, StageError> {
        let now = self.ctx.clock.now();
        let lead = match self
            .ctx
            .store
            .claim_lead(lead_id, now, lease_cutoff(now, self.lease()))
            .await
        {
            Ok(lead) => lead,
            Err(StoreError::Conflict(_)) => return self.contended(lead_id).await,
            Err(e) => return Err(e.into()),
        };

        let claim = Claim {
            store: Arc::clone(&self.ctx.store),
            clock: Arc::clone(&self.ctx.clock),
            lead_id,
            settled: false,
        };
        let outcome = self.deliver(lead).await?;
        claim.settle();
        Ok(outcome)
    }

    async fn deliver(&self, mut lead: Lead) -> Result<SubmissionOutcome, StageError> {
        let payload = json!({ "lead_id": lead.id, "lead": lead.data });
        let attempts = self.policy.attempts();
        let mut last_error: Option<ExternalError> = None;

        for attempt in 1..=attempts {
            lead.attempts += 1;
            let result = with_timeout("crm", self.timeout, self.crm.submit(&payload))
                .await
                .and_then(|resp| resp.interpret());

            match result {
                Ok(reference) => return self.finish_submitted(lead, reference, attempt).await,
                Err(e) if e.is_retryable() => {
                    warn!(lead_id = %lead.id, attempt, max_attempts = attempts, error = %e, "CRM submission failed; will retry if budget remains");
                    lead.last_error = Some(e.to_string());
                    lead.updated_at = self.ctx.clock.now();
                    self.ctx.store.save_lead(&lead).await?;
                    last_error = Some(e);

                    if let Some(delay) = self.policy.delay_for_attempt(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return self.finish_rejected(lead, e).await,
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        self.finish_dead_lettered(lead, error, attempts).await
    }

    /// Manually push a lead through `submit` again (dead-lettered or failed).
    pub async fn resubmit(&self, lead_id: Uuid) -> Result<SubmissionOutcome, StageError> {
        info!(lead_id = %lead_id, "Lead resubmission requested");
        self.submit(lead_id).await
    }

    /// Resubmit every unresolved dead letter once.
    pub async fn reprocess_dead_letters(&self) -> Result<ReprocessSummary, StageError> {
        let entries = self.ctx.store.unresolved_dead_letters().await?;
        let mut summary = ReprocessSummary::default();

        for entry in entries {
            summary.attempted += 1;
            match self.submit(entry.lead_id).await {
                Ok(SubmissionOutcome::Submitted { .. }) => summary.submitted += 1,
                Ok(SubmissionOutcome::AlreadySubmitted { .. }) => {
                    self.ctx
                        .store
                        .resolve_dead_letter(entry.lead_id, self.ctx.clock.now())
                        .await?;
                    summary.submitted += 1;
                }
                Ok(_) => summary.still_failing += 1,
                Err(e) => {
                    warn!(lead_id = %entry.lead_id, error = %e, "Dead letter reprocessing failed");
                    summary.still_failing += 1;
                }
            }
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                submitted = summary.submitted,
                still_failing = summary.still_failing,
                "Dead letters reprocessed"
            );
        }
        Ok(summary)
    }

    // ── Outcomes ────────────────────────────────────────────────────

    async fn contended(&self, lead_id: Uuid) -> Result<SubmissionOutcome, StageError> {
        let lead = self
            .ctx
            .store
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| StoreError::not_found("lead", lead_id))?;
        Ok(match lead.status {
            LeadStatus::Submitted => SubmissionOutcome::AlreadySubmitted {
                reference: lead.external_reference,
            },
            _ => SubmissionOutcome::InFlight,
        })
    }

    fn advance(lead: &mut Lead, to: LeadStatus) -> Result<(), StageError> {
        if !lead.status.can_transition_to(to) {
            return Err(StageError::Transition {
                lead_id: lead.id,
                from: lead.status,
                to,
            });
        }
        lead.status = to;
        Ok(())
    }

    async fn finish_submitted(
        &self,
        mut lead: Lead,
        reference: String,
        attempt: u32,
    ) -> Result<SubmissionOutcome, StageError> {
        let now = self.ctx.clock.now();
        Self::advance(&mut lead, LeadStatus::Submitted)?;
        lead.external_reference = Some(reference.clone());
        lead.last_error = None;
        lead.submitted_at = Some(now);
        lead.updated_at = now;
        self.ctx.store.save_lead(&lead).await?;
        self.ctx.store.resolve_dead_letter(lead.id, now).await?;

        info!(lead_id = %lead.id, reference = %reference, attempt, "Lead submitted");
        self.ctx
            .activity
            .record(
                Stage::LeadSubmitter,
                "submit",
                lead.id.to_string(),
                Outcome::Success,
                json!({ "reference": reference, "attempts": attempt }),
            )
            .await;
        self.ctx
            .emit(PipelineEvent::LeadSubmitted {
                lead_id: lead.id,
                visitor_id: lead.visitor_id,
                reference: reference.clone(),
            })
            .await;

        Ok(SubmissionOutcome::Submitted {
            reference,
            attempts: attempt,
        })
    }

    async fn finish_rejected(
        &self,
        mut lead: Lead,
        e: ExternalError,
    ) -> Result<SubmissionOutcome, StageError> {
        Self::advance(&mut lead, LeadStatus::Failed)?;
        lead.last_error = Some(e.to_string());
        lead.updated_at = self.ctx.clock.now();
        self.ctx.store.save_lead(&lead).await?;

        let status = match &e {
            ExternalError::Terminal { status, .. } => *status,
            _ => None,
        };
        warn!(lead_id = %lead.id, error = %e, "CRM rejected lead");
        self.ctx
            .activity
            .record(
                Stage::LeadSubmitter,
                "submit",
                lead.id.to_string(),
                Outcome::Failure,
                json!({ "error": "terminal_external", "status": status, "detail": e.to_string() }),
            )
            .await;

        Ok(SubmissionOutcome::Rejected {
            status,
            reason: e.to_string(),
        })
    }

    async fn finish_dead_lettered(
        &self,
        mut lead: Lead,
        error: String,
        attempts: u32,
    ) -> Result<SubmissionOutcome, StageError> {
        let now = self.ctx.clock.now();
        Self::advance(&mut lead, LeadStatus::DeadLettered)?;
        lead.last_error = Some(error.clone());
        lead.updated_at = now;
        // Entry first: a dead-lettered lead always has one to reprocess.
        self.ctx
            .store
            .put_dead_letter(&DeadLetterEntry {
                lead_id: lead.id,
                error: error.clone(),
                attempts: lead.attempts,
                dead_lettered_at: now,
                resolved_at: None,
            })
            .await?;
        self.ctx.store.save_lead(&lead).await?;

        error!(lead_id = %lead.id, attempts, error = %error, "Lead dead-lettered");
        self.ctx
            .activity
            .record(
                Stage::LeadSubmitter,
                "submit",
                lead.id.to_string(),
                Outcome::Failure,
                json!({ "error": "retries_exhausted", "attempts": attempts, "detail": error }),
            )
            .await;
        self.ctx
            .emit(PipelineEvent::LeadDeadLettered {
                lead_id: lead.id,
                visitor_id: lead.visitor_id,
                error: error.clone(),
            })
            .await;

        Ok(SubmissionOutcome::DeadLettered { error, attempts })
    }
}
