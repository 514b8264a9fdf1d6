//! Backend-agnostic persistence for the pipeline.
//!
//! Every method is atomic with respect to concurrent callers. The
//! check-then-act operations (`insert_visitor_if_absent`, `update_visitor`,
//! `issue_token_if_none_live`, `claim_dispatch`, `redeem_token`,
//! `insert_lead_if_absent`, `claim_lead`, `transition_lead`) are the ones
//! stages rely on for idempotency and single-flight guarantees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{RedeemError, StoreError};
use crate::model::{DeadLetterEntry, EmailHash, Lead, LeadStatus, ReturnToken, Visitor};

#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ── Visitors ────────────────────────────────────────────────────

    async fn get_visitor(&self, id: Uuid) -> Result<Option<Visitor>, StoreError>;

    async fn find_visitor_by_email_hash(
        &self,
        email_hash: &EmailHash,
    ) -> Result<Option<Visitor>, StoreError>;

    /// Insert unless a visitor with the same email hash exists.
    ///
    /// Returns the stored visitor and whether it was created.
    async fn insert_visitor_if_absent(&self, visitor: &Visitor)
    -> Result<(Visitor, bool), StoreError>;

    /// Write back a visitor read earlier. Fails with `Conflict` if the
    /// stored version moved on since the read, or if the email hash
    /// differs. Returns the stored record with its new version.
    async fn update_visitor(&self, visitor: &Visitor) -> Result<Visitor, StoreError>;

    /// Visitors not yet marked abandoned whose last activity is before `cutoff`.
    async fn inactive_visitors(&self, cutoff: DateTime<Utc>) -> Result<Vec<Visitor>, StoreError>;

    // ── Contact vault ───────────────────────────────────────────────

    /// Remember where to reach a visitor. Kept apart from the Visitor record;
    /// durable backends never hold the address in clear.
    async fn put_contact(&self, visitor_id: Uuid, address: &str) -> Result<(), StoreError>;

    async fn get_contact(&self, visitor_id: Uuid) -> Result<Option<String>, StoreError>;

    // ── Return tokens ───────────────────────────────────────────────

    async fn insert_token(&self, token: &ReturnToken) -> Result<(), StoreError>;

    /// Insert `token` unless its visitor already holds a live token for the
    /// same step. Returns the live token and whether it was inserted.
    async fn issue_token_if_none_live(
        &self,
        token: &ReturnToken,
        now: DateTime<Utc>,
    ) -> Result<(ReturnToken, bool), StoreError>;

    /// Unused, unexpired token issued for this visitor at this step.
    async fn live_token_for(
        &self,
        visitor_id: Uuid,
        abandonment_step: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<ReturnToken>, StoreError>;

    /// Most recently issued token for the visitor, in any state.
    async fn latest_token_for(&self, visitor_id: Uuid) -> Result<Option<ReturnToken>, StoreError>;

    /// Take the right to send the message for this token. Succeeds only if
    /// nothing was sent yet and no claim newer than `stale_before` exists.
    async fn claim_dispatch(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop a dispatch claim after a failed send.
    async fn release_dispatch(&self, token_value: &str) -> Result<(), StoreError>;

    /// Record the send and clear the dispatch claim.
    async fn mark_message_sent(&self, token_value: &str) -> Result<(), StoreError>;

    /// Atomically check freshness and flip `used`. At most one caller
    /// ever succeeds for a given token.
    async fn redeem_token(&self, token_value: &str, now: DateTime<Utc>)
    -> Result<ReturnToken, RedeemError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert unless a lead for the same `(visitor_id, credit_check_id)` exists.
    async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<(Lead, bool), StoreError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError>;

    /// Compare-and-set the status. Fails with `Conflict` when the current
    /// status is not one of `from`.
    async fn transition_lead(
        &self,
        id: Uuid,
        from: &[LeadStatus],
        to: LeadStatus,
        at: DateTime<Utc>,
    ) -> Result<Lead, StoreError>;

    /// Claim a lead for delivery: move it to `processing` from any
    /// submittable status, or take over a `processing` lead whose
    /// `updated_at` is at or before `stale_before`. `Conflict` otherwise.
    async fn claim_lead(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Lead, StoreError>;

    /// Persist attempt bookkeeping (attempts, reference, error, timestamps).
    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    async fn leads_with_status(&self, status: LeadStatus) -> Result<Vec<Lead>, StoreError>;

    // ── Dead letters ────────────────────────────────────────────────

    /// Insert or replace the entry for `entry.lead_id`.
    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    async fn unresolved_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn resolve_dead_letter(&self, lead_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}
