//! In-process store. Every operation runs under one write lock, which is
//! what makes the check-then-act methods atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::activity::{ActivityRecord, AuditSink};
use crate::error::{RedeemError, StoreError};
use crate::model::{DeadLetterEntry, EmailHash, Lead, LeadStatus, ReturnToken, Visitor};
use crate::store::traits::PipelineStore;

#[derive(Default)]
struct Inner {
    visitors: HashMap<Uuid, Visitor>,
    visitors_by_hash: HashMap<EmailHash, Uuid>,
    contacts: HashMap<Uuid, String>,
    tokens: HashMap<String, ReturnToken>,
    leads: HashMap<Uuid, Lead>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
    activity: Vec<ActivityRecord>,
}

/// Memory-backed [`PipelineStore`] and [`AuditSink`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visitors held (tests, diagnostics).
    pub async fn visitor_count(&self) -> usize {
        self.inner.read().await.visitors.len()
    }

    pub async fn activity_len(&self) -> usize {
        self.inner.read().await.activity.len()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get_visitor(&self, id: Uuid) -> Result<Option<Visitor>, StoreError> {
        Ok(self.inner.read().await.visitors.get(&id).cloned())
    }

    async fn find_visitor_by_email_hash(
        &self,
        email_hash: &EmailHash,
    ) -> Result<Option<Visitor>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .visitors_by_hash
            .get(email_hash)
            .and_then(|id| inner.visitors.get(id))
            .cloned())
    }

    async fn insert_visitor_if_absent(
        &self,
        visitor: &Visitor,
    ) -> Result<(Visitor, bool), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .visitors_by_hash
            .get(&visitor.email_hash)
            .and_then(|id| inner.visitors.get(id))
        {
            return Ok((existing.clone(), false));
        }
        inner
            .visitors_by_hash
            .insert(visitor.email_hash.clone(), visitor.id);
        inner.visitors.insert(visitor.id, visitor.clone());
        Ok((visitor.clone(), true))
    }

    async fn update_visitor(&self, visitor: &Visitor) -> Result<Visitor, StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .visitors
            .get_mut(&visitor.id)
            .ok_or_else(|| StoreError::not_found("visitor", visitor.id))?;
        if slot.email_hash != visitor.email_hash {
            return Err(StoreError::Conflict("visitor email hash is immutable".into()));
        }
        if slot.version != visitor.version {
            return Err(StoreError::Conflict(format!(
                "visitor {} is at version {}, update was based on {}",
                visitor.id, slot.version, visitor.version
            )));
        }
        let mut stored = visitor.clone();
        stored.version += 1;
        *slot = stored.clone();
        Ok(stored)
    }

    async fn inactive_visitors(&self, cutoff: DateTime<Utc>) -> Result<Vec<Visitor>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Visitor> = inner
            .visitors
            .values()
            .filter(|v| !v.abandoned && v.last_activity_at < cutoff)
            .cloned()
            .collect();
        out.sort_by_key(|v| v.last_activity_at);
        Ok(out)
    }

    async fn put_contact(&self, visitor_id: Uuid, address: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .contacts
            .insert(visitor_id, address.to_string());
        Ok(())
    }

    async fn get_contact(&self, visitor_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.contacts.get(&visitor_id).cloned())
    }

    async fn insert_token(&self, token: &ReturnToken) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tokens.contains_key(&token.value) {
            return Err(StoreError::Conflict("duplicate token value".into()));
        }
        inner.tokens.insert(token.value.clone(), token.clone());
        Ok(())
    }

    async fn issue_token_if_none_live(
        &self,
        token: &ReturnToken,
        now: DateTime<Utc>,
    ) -> Result<(ReturnToken, bool), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(live) = inner
            .tokens
            .values()
            .filter(|t| {
                t.visitor_id == token.visitor_id
                    && t.abandonment_step == token.abandonment_step
                    && t.is_live_at(now)
            })
            .max_by_key(|t| t.issued_at)
        {
            return Ok((live.clone(), false));
        }
        if inner.tokens.contains_key(&token.value) {
            return Err(StoreError::Conflict("duplicate token value".into()));
        }
        inner.tokens.insert(token.value.clone(), token.clone());
        Ok((token.clone(), true))
    }

    async fn live_token_for(
        &self,
        visitor_id: Uuid,
        abandonment_step: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<ReturnToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| {
                t.visitor_id == visitor_id
                    && t.abandonment_step == abandonment_step
                    && t.is_live_at(now)
            })
            .max_by_key(|t| t.issued_at)
            .cloned())
    }

    async fn latest_token_for(&self, visitor_id: Uuid) -> Result<Option<ReturnToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.visitor_id == visitor_id)
            .max_by_key(|t| t.issued_at)
            .cloned())
    }

    async fn claim_dispatch(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let token = inner
            .tokens
            .get_mut(token_value)
            .ok_or_else(|| StoreError::not_found("return_token", token_prefix(token_value)))?;
        if token.message_sent || token.dispatch_claimed_at.is_some_and(|at| at > stale_before) {
            return Ok(false);
        }
        token.dispatch_claimed_at = Some(now);
        Ok(true)
    }

    async fn release_dispatch(&self, token_value: &str) -> Result<(), StoreError> {
        if let Some(token) = self.inner.write().await.tokens.get_mut(token_value) {
            token.dispatch_claimed_at = None;
        }
        Ok(())
    }

    async fn mark_message_sent(&self, token_value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let token = inner
            .tokens
            .get_mut(token_value)
            .ok_or_else(|| StoreError::not_found("return_token", token_prefix(token_value)))?;
        token.message_sent = true;
        token.dispatch_claimed_at = None;
        Ok(())
    }

    async fn redeem_token(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<ReturnToken, RedeemError> {
        let mut inner = self.inner.write().await;
        let token = inner.tokens.get_mut(token_value).ok_or(RedeemError::NotFound)?;
        if token.is_expired_at(now) {
            return Err(RedeemError::Expired);
        }
        if token.used {
            return Err(RedeemError::AlreadyUsed);
        }
        token.used = true;
        token.redeemed_at = Some(now);
        Ok(token.clone())
    }

    async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<(Lead, bool), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .leads
            .values()
            .find(|l| l.visitor_id == lead.visitor_id && l.credit_check_id == lead.credit_check_id)
        {
            return Ok((existing.clone(), false));
        }
        inner.leads.insert(lead.id, lead.clone());
        Ok((lead.clone(), true))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        Ok(self.inner.read().await.leads.get(&id).cloned())
    }

    async fn transition_lead(
        &self,
        id: Uuid,
        from: &[LeadStatus],
        to: LeadStatus,
        at: DateTime<Utc>,
    ) -> Result<Lead, StoreError> {
        let mut inner = self.inner.write().await;
        let lead = inner
            .leads
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("lead", id))?;
        if !from.contains(&lead.status) {
            return Err(StoreError::Conflict(format!(
                "lead {id} is {}, expected one of {from:?}",
                lead.status
            )));
        }
        lead.status = to;
        lead.updated_at = at;
        Ok(lead.clone())
    }

    async fn claim_lead(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Lead, StoreError> {
        let mut inner = self.inner.write().await;
        let lead = inner
            .leads
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("lead", id))?;
        let stale = lead.status == LeadStatus::Processing && lead.updated_at <= stale_before;
        if !stale && !LeadStatus::SUBMITTABLE.contains(&lead.status) {
            return Err(StoreError::Conflict(format!("lead {id} is {}", lead.status)));
        }
        lead.status = LeadStatus::Processing;
        lead.updated_at = now;
        Ok(lead.clone())
    }

    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .leads
            .get_mut(&lead.id)
            .ok_or_else(|| StoreError::not_found("lead", lead.id))?;
        *slot = lead.clone();
        Ok(())
    }

    async fn leads_with_status(&self, status: LeadStatus) -> Result<Vec<Lead>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Lead> = inner
            .leads
            .values()
            .filter(|l| l.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .dead_letters
            .insert(entry.lead_id, entry.clone());
        Ok(())
    }

    async fn unresolved_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<DeadLetterEntry> = inner
            .dead_letters
            .values()
            .filter(|d| d.resolved_at.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|d| d.dead_lettered_at);
        Ok(out)
    }

    async fn resolve_dead_letter(&self, lead_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.dead_letters.get_mut(&lead_id) {
            entry.resolved_at = Some(at);
        }
        Ok(())
    }
}

fn token_prefix(value: &str) -> &str {
    value.get(..8).unwrap_or(value)
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, record: ActivityRecord) -> Result<(), StoreError> {
        self.inner.write().await.activity.push(record);
        Ok(())
    }

    async fn records_for(&self, target_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .activity
            .iter()
            .filter(|r| r.target_id == target_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn visitor(email: &str) -> Visitor {
        Visitor::new(EmailHash::from_email(email).unwrap(), "s1", 2, Utc::now())
    }

    #[tokio::test]
    async fn insert_if_absent_dedupes_by_hash() {
        let store = MemoryStore::new();
        let (first, created) = store.insert_visitor_if_absent(&visitor("a@b.com")).await.unwrap();
        assert!(created);

        let (second, created) = store.insert_visitor_if_absent(&visitor("A@B.com")).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(store.visitor_count().await, 1);
    }

    #[tokio::test]
    async fn update_rejects_hash_change() {
        let store = MemoryStore::new();
        let (mut v, _) = store.insert_visitor_if_absent(&visitor("a@b.com")).await.unwrap();
        v.email_hash = EmailHash::from_email("c@d.com").unwrap();
        assert!(matches!(store.update_visitor(&v).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn stale_visitor_write_is_rejected() {
        let store = MemoryStore::new();
        let (read_a, _) = store.insert_visitor_if_absent(&visitor("a@b.com")).await.unwrap();
        let mut read_b = read_a.clone();

        let mut resumed = read_a;
        resumed.abandoned = false;
        let stored = store.update_visitor(&resumed).await.unwrap();
        assert_eq!(stored.version, 1);

        read_b.abandoned = true;
        assert!(matches!(store.update_visitor(&read_b).await, Err(StoreError::Conflict(_))));
        let current = store.get_visitor(stored.id).await.unwrap().unwrap();
        assert!(!current.abandoned);
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn one_live_token_per_visitor_step() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let visitor_id = Uuid::new_v4();
        let first = ReturnToken::issue(visitor_id, 3, now);
        let (issued, inserted) = store.issue_token_if_none_live(&first, now).await.unwrap();
        assert!(inserted);
        assert_eq!(issued.value, first.value);

        let later = now + Duration::hours(1);
        let (again, inserted) = store
            .issue_token_if_none_live(&ReturnToken::issue(visitor_id, 3, later), later)
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(again.value, first.value);
        assert_eq!(again.expires_at, first.expires_at);

        let expired = first.expires_at;
        let (fresh, inserted) = store
            .issue_token_if_none_live(&ReturnToken::issue(visitor_id, 3, expired), expired)
            .await
            .unwrap();
        assert!(inserted);
        assert_ne!(fresh.value, first.value);
    }

    #[tokio::test]
    async fn dispatch_claim_is_exclusive_until_released_or_stale() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = ReturnToken::issue(Uuid::new_v4(), 2, now);
        store.insert_token(&token).await.unwrap();
        let lease = Duration::seconds(30);

        assert!(store.claim_dispatch(&token.value, now, now - lease).await.unwrap());
        assert!(!store.claim_dispatch(&token.value, now, now - lease).await.unwrap());

        store.release_dispatch(&token.value).await.unwrap();
        assert!(store.claim_dispatch(&token.value, now, now - lease).await.unwrap());

        let later = now + Duration::seconds(31);
        assert!(store.claim_dispatch(&token.value, later, later - lease).await.unwrap());

        store.mark_message_sent(&token.value).await.unwrap();
        let never = later + Duration::hours(1);
        assert!(!store.claim_dispatch(&token.value, never, never).await.unwrap());
    }

    #[tokio::test]
    async fn redeem_is_single_use() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let token = ReturnToken::issue(Uuid::new_v4(), 2, now);
        store.insert_token(&token).await.unwrap();

        let redeemed = store.redeem_token(&token.value, now).await.unwrap();
        assert!(redeemed.used);
        assert_eq!(redeemed.redeemed_at, Some(now));
        assert!(matches!(
            store.redeem_token(&token.value, now).await,
            Err(RedeemError::AlreadyUsed)
        ));
        assert!(matches!(
            store.redeem_token("missing", now).await,
            Err(RedeemError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeem_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let token = ReturnToken::issue(Uuid::new_v4(), 2, now);
        store.insert_token(&token).await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                let value = token.value.clone();
                tokio::spawn(async move { store.redeem_token(&value, now).await })
            })
            .collect();

        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(RedeemError::AlreadyUsed) => {}
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn live_token_ignores_other_steps_and_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let visitor_id = Uuid::new_v4();
        let old = ReturnToken::issue(visitor_id, 2, now - Duration::hours(25));
        let other_step = ReturnToken::issue(visitor_id, 3, now);
        store.insert_token(&old).await.unwrap();
        store.insert_token(&other_step).await.unwrap();

        assert!(store.live_token_for(visitor_id, 2, now).await.unwrap().is_none());
        let live = store.live_token_for(visitor_id, 3, now).await.unwrap().unwrap();
        assert_eq!(live.value, other_step.value);
        let latest = store.latest_token_for(visitor_id).await.unwrap().unwrap();
        assert_eq!(latest.value, other_step.value);
    }

    #[tokio::test]
    async fn dead_letters_resolve() {
        let store = MemoryStore::new();
        let lead_id = Uuid::new_v4();
        store
            .put_dead_letter(&DeadLetterEntry {
                lead_id,
                error: "500".into(),
                attempts: 3,
                dead_lettered_at: Utc::now(),
                resolved_at: None,
            })
            .await
            .unwrap();
        assert_eq!(store.unresolved_dead_letters().await.unwrap().len(), 1);

        store.resolve_dead_letter(lead_id, Utc::now()).await.unwrap();
        assert!(store.unresolved_dead_letters().await.unwrap().is_empty());
    }
}
