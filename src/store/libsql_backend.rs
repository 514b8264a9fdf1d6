//! libSQL backend: durable `PipelineStore` and `AuditSink`.
//!
//! Atomic check-then-act operations are expressed as single conditional
//! statements (`ON CONFLICT DO NOTHING`, `INSERT ... WHERE NOT EXISTS`,
//! `UPDATE ... WHERE version = ?`), so they hold across processes sharing
//! the same database file. Contact addresses are sealed with
//! [`ContactCipher`] before they reach disk.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, Value, params};
use secrecy::SecretString;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::{ActivityRecord, AuditSink};
use crate::error::{RedeemError, StoreError};
use crate::model::{
    CreditStatus, DeadLetterEntry, EmailHash, Lead, LeadSnapshot, LeadStatus, PhoneNumber,
    ReturnToken, Visitor,
};
use crate::store::migrations;
use crate::store::traits::PipelineStore;
use crate::store::vault::ContactCipher;

const VISITOR_COLUMNS: &str = "id, email_hash, session_id, last_activity_at, abandonment_step, abandoned, phone_number, metadata, credit_status, lead_ready_step, created_at, updated_at, version";

const TOKEN_COLUMNS: &str = "value, visitor_id, abandonment_step, issued_at, expires_at, used, redeemed_at, message_sent, dispatch_claimed_at";

const LEAD_COLUMNS: &str = "id, visitor_id, credit_check_id, data, status, external_reference, attempts, last_error, created_at, updated_at, submitted_at";

/// libSQL database backend.
///
/// One connection is reused for all operations; `libsql::Connection` is
/// `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    contacts: ContactCipher,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    /// `contact_key` seals the contact vault.
    pub async fn new_local(path: &Path, contact_key: &SecretString) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Query(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db, contact_key).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// In-memory database (tests).
    pub async fn new_memory(contact_key: &SecretString) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db, contact_key).await
    }

    async fn from_database(
        db: LibSqlDatabase,
        contact_key: &SecretString,
    ) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Query(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            contacts: ContactCipher::from_secret(contact_key)?,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: impl Fn(&Row) -> Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("{op}: {e}"))),
        }
    }

    async fn query_all<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: impl Fn(&Row) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(map(&row)?),
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(out)
    }

    async fn exec(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<u64, StoreError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))
    }

    async fn get_token(&self, value: &str) -> Result<Option<ReturnToken>, StoreError> {
        self.query_one(
            "get_token",
            &format!("SELECT {TOKEN_COLUMNS} FROM return_tokens WHERE value = ?1"),
            params![value],
            row_to_token,
        )
        .await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexicographic comparison in SQL matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    dt.map(|d| Value::Text(ts(d))).unwrap_or(Value::Null)
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn col_text(row: &Row, idx: i32) -> Result<String, StoreError> {
    row.get::<String>(idx)
        .map_err(|e| StoreError::Serialization(format!("column {idx}: {e}")))
}

fn col_i64(row: &Row, idx: i32) -> Result<i64, StoreError> {
    row.get::<i64>(idx)
        .map_err(|e| StoreError::Serialization(format!("column {idx}: {e}")))
}

fn col_opt_text(row: &Row, idx: i32) -> Result<Option<String>, StoreError> {
    match row
        .get_value(idx)
        .map_err(|e| StoreError::Serialization(format!("column {idx}: {e}")))?
    {
        Value::Text(s) => Ok(Some(s)),
        Value::Null => Ok(None),
        other => Err(StoreError::Serialization(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn col_opt_i64(row: &Row, idx: i32) -> Result<Option<i64>, StoreError> {
    match row
        .get_value(idx)
        .map_err(|e| StoreError::Serialization(format!("column {idx}: {e}")))?
    {
        Value::Integer(n) => Ok(Some(n)),
        Value::Null => Ok(None),
        other => Err(StoreError::Serialization(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn credit_status_to_str(status: CreditStatus) -> &'static str {
    match status {
        CreditStatus::Approved => "approved",
        CreditStatus::Declined => "declined",
    }
}

fn str_to_credit_status(s: &str) -> Option<CreditStatus> {
    match s {
        "approved" => Some(CreditStatus::Approved),
        "declined" => Some(CreditStatus::Declined),
        _ => None,
    }
}

fn status_list(statuses: &[LeadStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column order matches `VISITOR_COLUMNS`.
fn row_to_visitor(row: &Row) -> Result<Visitor, StoreError> {
    let metadata: BTreeMap<String, String> = serde_json::from_str(&col_text(row, 7)?)?;
    let phone_number = col_opt_text(row, 6)?
        .map(|p| PhoneNumber::parse(&p))
        .transpose()
        .map_err(|e| StoreError::Serialization(format!("stored phone: {e}")))?;
    let email_hash = EmailHash::from_hex(&col_text(row, 1)?)
        .map_err(|e| StoreError::Serialization(format!("stored email hash: {e}")))?;

    Ok(Visitor {
        id: parse_uuid(&col_text(row, 0)?)?,
        email_hash,
        session_id: col_text(row, 2)?,
        last_activity_at: parse_ts(&col_text(row, 3)?)?,
        abandonment_step: col_i64(row, 4)? as u32,
        abandoned: col_i64(row, 5)? != 0,
        phone_number,
        metadata,
        credit_status: col_opt_text(row, 8)?.as_deref().and_then(str_to_credit_status),
        lead_ready_step: col_opt_i64(row, 9)?.map(|s| s as u32),
        created_at: parse_ts(&col_text(row, 10)?)?,
        updated_at: parse_ts(&col_text(row, 11)?)?,
        version: col_i64(row, 12)? as u64,
    })
}

/// Column order matches `TOKEN_COLUMNS`.
fn row_to_token(row: &Row) -> Result<ReturnToken, StoreError> {
    Ok(ReturnToken {
        value: col_text(row, 0)?,
        visitor_id: parse_uuid(&col_text(row, 1)?)?,
        abandonment_step: col_i64(row, 2)? as u32,
        issued_at: parse_ts(&col_text(row, 3)?)?,
        expires_at: parse_ts(&col_text(row, 4)?)?,
        used: col_i64(row, 5)? != 0,
        redeemed_at: col_opt_text(row, 6)?.as_deref().map(parse_ts).transpose()?,
        message_sent: col_i64(row, 7)? != 0,
        dispatch_claimed_at: col_opt_text(row, 8)?.as_deref().map(parse_ts).transpose()?,
    })
}

/// Column order matches `LEAD_COLUMNS`.
fn row_to_lead(row: &Row) -> Result<Lead, StoreError> {
    let data: LeadSnapshot = serde_json::from_str(&col_text(row, 3)?)?;
    let status: LeadStatus = col_text(row, 4)?
        .parse()
        .map_err(StoreError::Serialization)?;
    Ok(Lead {
        id: parse_uuid(&col_text(row, 0)?)?,
        visitor_id: parse_uuid(&col_text(row, 1)?)?,
        credit_check_id: parse_uuid(&col_text(row, 2)?)?,
        data,
        status,
        external_reference: col_opt_text(row, 5)?,
        attempts: col_i64(row, 6)? as u32,
        last_error: col_opt_text(row, 7)?,
        created_at: parse_ts(&col_text(row, 8)?)?,
        updated_at: parse_ts(&col_text(row, 9)?)?,
        submitted_at: col_opt_text(row, 10)?.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_dead_letter(row: &Row) -> Result<DeadLetterEntry, StoreError> {
    Ok(DeadLetterEntry {
        lead_id: parse_uuid(&col_text(row, 0)?)?,
        error: col_text(row, 1)?,
        attempts: col_i64(row, 2)? as u32,
        dead_lettered_at: parse_ts(&col_text(row, 3)?)?,
        resolved_at: col_opt_text(row, 4)?.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_activity(row: &Row) -> Result<ActivityRecord, StoreError> {
    Ok(ActivityRecord {
        id: parse_uuid(&col_text(row, 0)?)?,
        stage: col_text(row, 1)?.parse().map_err(StoreError::Serialization)?,
        action: col_text(row, 2)?,
        target_id: col_text(row, 3)?,
        outcome: col_text(row, 4)?.parse().map_err(StoreError::Serialization)?,
        timestamp: parse_ts(&col_text(row, 5)?)?,
        metadata: serde_json::from_str(&col_text(row, 6)?)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl PipelineStore for LibSqlStore {
    // ── Visitors ────────────────────────────────────────────────────

    async fn get_visitor(&self, id: Uuid) -> Result<Option<Visitor>, StoreError> {
        self.query_one(
            "get_visitor",
            &format!("SELECT {VISITOR_COLUMNS} FROM visitors WHERE id = ?1"),
            params![id.to_string()],
            row_to_visitor,
        )
        .await
    }

    async fn find_visitor_by_email_hash(
        &self,
        email_hash: &EmailHash,
    ) -> Result<Option<Visitor>, StoreError> {
        self.query_one(
            "find_visitor_by_email_hash",
            &format!("SELECT {VISITOR_COLUMNS} FROM visitors WHERE email_hash = ?1"),
            params![email_hash.as_str()],
            row_to_visitor,
        )
        .await
    }

    async fn insert_visitor_if_absent(
        &self,
        visitor: &Visitor,
    ) -> Result<(Visitor, bool), StoreError> {
        let inserted = self
            .exec(
                "insert_visitor_if_absent",
                &format!(
                    "INSERT INTO visitors ({VISITOR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(email_hash) DO NOTHING"
                ),
                params![
                    visitor.id.to_string(),
                    visitor.email_hash.as_str(),
                    visitor.session_id.as_str(),
                    ts(visitor.last_activity_at),
                    visitor.abandonment_step as i64,
                    visitor.abandoned as i64,
                    opt_text(visitor.phone_number.as_ref().map(|p| p.as_str())),
                    serde_json::to_string(&visitor.metadata)?,
                    opt_text(visitor.credit_status.map(credit_status_to_str)),
                    visitor.lead_ready_step.map(|s| Value::Integer(s as i64)).unwrap_or(Value::Null),
                    ts(visitor.created_at),
                    ts(visitor.updated_at),
                    visitor.version as i64,
                ],
            )
            .await?
            == 1;

        let stored = self
            .find_visitor_by_email_hash(&visitor.email_hash)
            .await?
            .ok_or_else(|| StoreError::not_found("visitor", visitor.email_hash.as_str()))?;
        if inserted {
            debug!(visitor_id = %stored.id, "Visitor inserted into DB");
        }
        Ok((stored, inserted))
    }

    async fn update_visitor(&self, visitor: &Visitor) -> Result<Visitor, StoreError> {
        let updated = self
            .exec(
                "update_visitor",
                "UPDATE visitors SET session_id = ?2, last_activity_at = ?3, abandonment_step = ?4, abandoned = ?5,
                    phone_number = ?6, metadata = ?7, credit_status = ?8, lead_ready_step = ?9, updated_at = ?10,
                    version = version + 1
                 WHERE id = ?1 AND email_hash = ?11 AND version = ?12",
                params![
                    visitor.id.to_string(),
                    visitor.session_id.as_str(),
                    ts(visitor.last_activity_at),
                    visitor.abandonment_step as i64,
                    visitor.abandoned as i64,
                    opt_text(visitor.phone_number.as_ref().map(|p| p.as_str())),
                    serde_json::to_string(&visitor.metadata)?,
                    opt_text(visitor.credit_status.map(credit_status_to_str)),
                    visitor.lead_ready_step.map(|s| Value::Integer(s as i64)).unwrap_or(Value::Null),
                    ts(visitor.updated_at),
                    visitor.email_hash.as_str(),
                    visitor.version as i64,
                ],
            )
            .await?;
        if updated == 0 {
            return match self.get_visitor(visitor.id).await? {
                Some(stored) if stored.email_hash != visitor.email_hash => {
                    Err(StoreError::Conflict("visitor email hash is immutable".into()))
                }
                Some(stored) => Err(StoreError::Conflict(format!(
                    "visitor {} is at version {}, update was based on {}",
                    visitor.id, stored.version, visitor.version
                ))),
                None => Err(StoreError::not_found("visitor", visitor.id)),
            };
        }
        let mut stored = visitor.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn inactive_visitors(&self, cutoff: DateTime<Utc>) -> Result<Vec<Visitor>, StoreError> {
        self.query_all(
            "inactive_visitors",
            &format!(
                "SELECT {VISITOR_COLUMNS} FROM visitors WHERE abandoned = 0 AND last_activity_at < ?1 ORDER BY last_activity_at"
            ),
            params![ts(cutoff)],
            row_to_visitor,
        )
        .await
    }

    // ── Contact vault ───────────────────────────────────────────────

    async fn put_contact(&self, visitor_id: Uuid, address: &str) -> Result<(), StoreError> {
        let sealed = self.contacts.seal(visitor_id, address)?;
        self.exec(
            "put_contact",
            "INSERT INTO visitor_contacts (visitor_id, sealed_address) VALUES (?1, ?2)
             ON CONFLICT(visitor_id) DO UPDATE SET sealed_address = excluded.sealed_address",
            params![visitor_id.to_string(), sealed],
        )
        .await?;
        Ok(())
    }

    async fn get_contact(&self, visitor_id: Uuid) -> Result<Option<String>, StoreError> {
        let sealed = self
            .query_one(
                "get_contact",
                "SELECT sealed_address FROM visitor_contacts WHERE visitor_id = ?1",
                params![visitor_id.to_string()],
                |row| col_text(row, 0),
            )
            .await?;
        sealed
            .map(|sealed| self.contacts.open(visitor_id, &sealed))
            .transpose()
    }

    // ── Return tokens ───────────────────────────────────────────────

    async fn insert_token(&self, token: &ReturnToken) -> Result<(), StoreError> {
        self.exec(
            "insert_token",
            &format!("INSERT INTO return_tokens ({TOKEN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                token.value.as_str(),
                token.visitor_id.to_string(),
                token.abandonment_step as i64,
                ts(token.issued_at),
                ts(token.expires_at),
                token.used as i64,
                opt_ts(token.redeemed_at),
                token.message_sent as i64,
                opt_ts(token.dispatch_claimed_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn issue_token_if_none_live(
        &self,
        token: &ReturnToken,
        now: DateTime<Utc>,
    ) -> Result<(ReturnToken, bool), StoreError> {
        let inserted = self
            .exec(
                "issue_token_if_none_live",
                &format!(
                    "INSERT INTO return_tokens ({TOKEN_COLUMNS})
                     SELECT ?1, ?2, ?3, ?4, ?5, 0, NULL, 0, NULL
                     WHERE NOT EXISTS (
                        SELECT 1 FROM return_tokens
                        WHERE visitor_id = ?2 AND abandonment_step = ?3 AND used = 0 AND expires_at > ?6
                     )"
                ),
                params![
                    token.value.as_str(),
                    token.visitor_id.to_string(),
                    token.abandonment_step as i64,
                    ts(token.issued_at),
                    ts(token.expires_at),
                    ts(now),
                ],
            )
            .await?
            == 1;

        let live = self
            .live_token_for(token.visitor_id, token.abandonment_step, now)
            .await?
            .ok_or_else(|| StoreError::not_found("return_token", token.fingerprint()))?;
        Ok((live, inserted))
    }

    async fn live_token_for(
        &self,
        visitor_id: Uuid,
        abandonment_step: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<ReturnToken>, StoreError> {
        self.query_one(
            "live_token_for",
            &format!(
                "SELECT {TOKEN_COLUMNS} FROM return_tokens
                 WHERE visitor_id = ?1 AND abandonment_step = ?2 AND used = 0 AND expires_at > ?3
                 ORDER BY issued_at DESC LIMIT 1"
            ),
            params![visitor_id.to_string(), abandonment_step as i64, ts(now)],
            row_to_token,
        )
        .await
    }

    async fn latest_token_for(&self, visitor_id: Uuid) -> Result<Option<ReturnToken>, StoreError> {
        self.query_one(
            "latest_token_for",
            &format!(
                "SELECT {TOKEN_COLUMNS} FROM return_tokens WHERE visitor_id = ?1 ORDER BY issued_at DESC LIMIT 1"
            ),
            params![visitor_id.to_string()],
            row_to_token,
        )
        .await
    }

    async fn claim_dispatch(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claimed = self
            .exec(
                "claim_dispatch",
                "UPDATE return_tokens SET dispatch_claimed_at = ?2
                 WHERE value = ?1 AND message_sent = 0
                   AND (dispatch_claimed_at IS NULL OR dispatch_claimed_at <= ?3)",
                params![token_value, ts(now), ts(stale_before)],
            )
            .await?;
        if claimed == 0 && self.get_token(token_value).await?.is_none() {
            return Err(StoreError::not_found("return_token", token_value.get(..8).unwrap_or(token_value)));
        }
        Ok(claimed == 1)
    }

    async fn release_dispatch(&self, token_value: &str) -> Result<(), StoreError> {
        self.exec(
            "release_dispatch",
            "UPDATE return_tokens SET dispatch_claimed_at = NULL WHERE value = ?1",
            params![token_value],
        )
        .await?;
        Ok(())
    }

    async fn mark_message_sent(&self, token_value: &str) -> Result<(), StoreError> {
        let updated = self
            .exec(
                "mark_message_sent",
                "UPDATE return_tokens SET message_sent = 1, dispatch_claimed_at = NULL WHERE value = ?1",
                params![token_value],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::not_found("return_token", token_value.get(..8).unwrap_or(token_value)));
        }
        Ok(())
    }

    async fn redeem_token(
        &self,
        token_value: &str,
        now: DateTime<Utc>,
    ) -> Result<ReturnToken, RedeemError> {
        let claimed = self
            .exec(
                "redeem_token",
                "UPDATE return_tokens SET used = 1, redeemed_at = ?2
                 WHERE value = ?1 AND used = 0 AND expires_at > ?2",
                params![token_value, ts(now)],
            )
            .await?;

        let token = self.get_token(token_value).await?.ok_or(RedeemError::NotFound)?;
        if claimed == 1 {
            return Ok(token);
        }
        if token.is_expired_at(now) {
            Err(RedeemError::Expired)
        } else {
            Err(RedeemError::AlreadyUsed)
        }
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<(Lead, bool), StoreError> {
        let inserted = self
            .exec(
                "insert_lead_if_absent",
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(visitor_id, credit_check_id) DO NOTHING"
                ),
                params![
                    lead.id.to_string(),
                    lead.visitor_id.to_string(),
                    lead.credit_check_id.to_string(),
                    serde_json::to_string(&lead.data)?,
                    lead.status.as_str(),
                    opt_text(lead.external_reference.as_deref()),
                    lead.attempts as i64,
                    opt_text(lead.last_error.as_deref()),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                    opt_ts(lead.submitted_at),
                ],
            )
            .await?
            == 1;

        let stored = self
            .query_one(
                "insert_lead_if_absent",
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE visitor_id = ?1 AND credit_check_id = ?2"),
                params![lead.visitor_id.to_string(), lead.credit_check_id.to_string()],
                row_to_lead,
            )
            .await?
            .ok_or_else(|| StoreError::not_found("lead", lead.id))?;
        Ok((stored, inserted))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        self.query_one(
            "get_lead",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
            params![id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn transition_lead(
        &self,
        id: Uuid,
        from: &[LeadStatus],
        to: LeadStatus,
        at: DateTime<Utc>,
    ) -> Result<Lead, StoreError> {
        let updated = self
            .exec(
                "transition_lead",
                &format!(
                    "UPDATE leads SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status IN ({})",
                    status_list(from)
                ),
                params![id.to_string(), to.as_str(), ts(at)],
            )
            .await?;

        let lead = self
            .get_lead(id)
            .await?
            .ok_or_else(|| StoreError::not_found("lead", id))?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "lead {id} is {}, expected one of {from:?}",
                lead.status
            )));
        }
        debug!(lead_id = %id, status = %to, "Lead status updated in DB");
        Ok(lead)
    }

    async fn claim_lead(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Lead, StoreError> {
        let claimed = self
            .exec(
                "claim_lead",
                &format!(
                    "UPDATE leads SET status = 'processing', updated_at = ?2
                     WHERE id = ?1 AND (status IN ({}) OR (status = 'processing' AND updated_at <= ?3))",
                    status_list(&LeadStatus::SUBMITTABLE)
                ),
                params![id.to_string(), ts(now), ts(stale_before)],
            )
            .await?;

        let lead = self
            .get_lead(id)
            .await?
            .ok_or_else(|| StoreError::not_found("lead", id))?;
        if claimed == 0 {
            return Err(StoreError::Conflict(format!("lead {id} is {}", lead.status)));
        }
        debug!(lead_id = %id, "Lead claimed for delivery");
        Ok(lead)
    }

    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let updated = self
            .exec(
                "save_lead",
                "UPDATE leads SET status = ?2, external_reference = ?3, attempts = ?4, last_error = ?5,
                    updated_at = ?6, submitted_at = ?7
                 WHERE id = ?1",
                params![
                    lead.id.to_string(),
                    lead.status.as_str(),
                    opt_text(lead.external_reference.as_deref()),
                    lead.attempts as i64,
                    opt_text(lead.last_error.as_deref()),
                    ts(lead.updated_at),
                    opt_ts(lead.submitted_at),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::not_found("lead", lead.id));
        }
        Ok(())
    }

    async fn leads_with_status(&self, status: LeadStatus) -> Result<Vec<Lead>, StoreError> {
        self.query_all(
            "leads_with_status",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE status = ?1 ORDER BY created_at"),
            params![status.as_str()],
            row_to_lead,
        )
        .await
    }

    // ── Dead letters ────────────────────────────────────────────────

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.exec(
            "put_dead_letter",
            "INSERT INTO dead_letters (lead_id, error, attempts, dead_lettered_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lead_id) DO UPDATE SET
                error = excluded.error,
                attempts = excluded.attempts,
                dead_lettered_at = excluded.dead_lettered_at,
                resolved_at = excluded.resolved_at",
            params![
                entry.lead_id.to_string(),
                entry.error.as_str(),
                entry.attempts as i64,
                ts(entry.dead_lettered_at),
                opt_ts(entry.resolved_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn unresolved_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.query_all(
            "unresolved_dead_letters",
            "SELECT lead_id, error, attempts, dead_lettered_at, resolved_at FROM dead_letters
             WHERE resolved_at IS NULL ORDER BY dead_lettered_at",
            (),
            row_to_dead_letter,
        )
        .await
    }

    async fn resolve_dead_letter(&self, lead_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.exec(
            "resolve_dead_letter",
            "UPDATE dead_letters SET resolved_at = ?2 WHERE lead_id = ?1",
            params![lead_id.to_string(), ts(at)],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for LibSqlStore {
    async fn append(&self, record: ActivityRecord) -> Result<(), StoreError> {
        self.exec(
            "append_activity",
            "INSERT INTO activity_log (id, stage, action, target_id, outcome, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.stage.as_str(),
                record.action.as_str(),
                record.target_id.as_str(),
                record.outcome.as_str(),
                ts(record.timestamp),
                record.metadata.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn records_for(&self, target_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        self.query_all(
            "records_for",
            "SELECT id, stage, action, target_id, outcome, timestamp, metadata FROM activity_log
             WHERE target_id = ?1 ORDER BY rowid",
            params![target_id],
            row_to_activity,
        )
        .await
    }
}
