//! Stage 1: abandonment detection.
//!
//! Turns intake signals (and, via [`AbandonmentDetector::sweep_inactive`],
//! plain inactivity) into Visitor records and emits `LeadReady` for
//! visitors who qualify for re-engagement. Raw email addresses are hashed
//! on entry; the plaintext only ever reaches the contact vault.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::{Outcome, Stage};
use crate::error::{ConfigError, StageError, ValidationError};
use crate::events::PipelineEvent;
use crate::model::{EmailHash, Visitor};
use crate::stages::StageContext;

/// Raw abandonment observation from the application front end.
///
/// Required fields are optional here so that a malformed payload still
/// reaches validation and leaves an audit record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AbandonmentSignal {
    pub session_id: Option<String>,
    /// Raw email address or a precomputed SHA-256 hex digest.
    pub email: Option<String>,
    pub step: Option<i64>,
    #[serde(default = "default_abandoned")]
    pub abandoned: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub observed_at: Option<DateTime<Utc>>,
}

fn default_abandoned() -> bool {
    true
}

struct ValidSignal {
    session_id: String,
    email_hash: EmailHash,
    raw_email: Option<String>,
    step: u32,
}

pub struct AbandonmentDetector {
    ctx: StageContext,
    metadata_whitelist: HashSet<String>,
    inactivity_threshold: Duration,
}

impl AbandonmentDetector {
    pub fn new(
        ctx: StageContext,
        metadata_whitelist: impl IntoIterator<Item = String>,
        inactivity_threshold: std::time::Duration,
    ) -> Result<Self, ConfigError> {
        let inactivity_threshold =
            Duration::from_std(inactivity_threshold).map_err(|e| ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_INACTIVITY_MINS".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            ctx,
            metadata_whitelist: metadata_whitelist.into_iter().collect(),
            inactivity_threshold,
        })
    }

    fn validate(signal: &AbandonmentSignal) -> Result<ValidSignal, ValidationError> {
        let session_id = signal
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField("session_id"))?;
        let email = signal
            .email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingField("email"))?;
        let step = signal.step.ok_or(ValidationError::MissingField("step"))?;
        let step = u32::try_from(step)
            .ok()
            .filter(|s| *s >= 1)
            .ok_or(ValidationError::InvalidStep(step))?;

        Ok(ValidSignal {
            session_id: session_id.to_string(),
            email_hash: EmailHash::from_email_or_hash(email)?,
            raw_email: email.contains('@').then(|| email.to_string()),
            step,
        })
    }

    /// Create or update the visitor for `signal` and emit `LeadReady` if it
    /// qualifies. Writes exactly one activity record per call.
    pub async fn detect(&self, signal: AbandonmentSignal) -> Result<Visitor, StageError> {
        let valid = match Self::validate(&signal) {
            Ok(v) => v,
            Err(e) => {
                let target = signal.session_id.clone().unwrap_or_else(|| "unknown".into());
                self.ctx
                    .activity
                    .record(
                        Stage::AbandonmentDetector,
                        "detect_abandonment",
                        target,
                        Outcome::Failure,
                        json!({ "error": "validation", "detail": e.to_string() }),
                    )
                    .await;
                return Err(e.into());
            }
        };

        let now = self.ctx.clock.now();
        let observed_at = signal.observed_at.unwrap_or(now);
        let metadata: BTreeMap<String, String> = signal
            .metadata
            .into_iter()
            .filter(|(k, _)| self.metadata_whitelist.contains(k))
            .collect();

        let mut candidate = Visitor::new(valid.email_hash, &valid.session_id, valid.step, observed_at);
        candidate.abandoned = signal.abandoned;
        candidate.metadata = metadata.clone();
        candidate.updated_at = now;

        let (inserted, created) = self.ctx.store.insert_visitor_if_absent(&candidate).await?;
        let (visitor, emitted) = self
            .ctx
            .modify_visitor(inserted.id, |visitor| {
                if !created {
                    // Latest observation wins for both step and activity time.
                    visitor.session_id = valid.session_id.clone();
                    visitor.abandonment_step = valid.step;
                    visitor.last_activity_at = observed_at;
                    visitor.abandoned = signal.abandoned;
                    visitor.metadata.extend(metadata.clone());
                    visitor.updated_at = now;
                }
                let emitted = self.mark_lead_ready(visitor);
                (!created || emitted).then_some(emitted)
            })
            .await?;
        let emitted = emitted.unwrap_or(false);
        if let Some(raw) = valid.raw_email {
            self.ctx.store.put_contact(visitor.id, &raw).await?;
        }

        if emitted {
            self.emit_lead_ready(&visitor).await;
        }

        info!(
            visitor_id = %visitor.id,
            email_hash = %visitor.email_hash,
            step = visitor.abandonment_step,
            created,
            qualified = visitor.qualifies_for_reengagement(),
            "Abandonment signal processed"
        );
        self.ctx
            .activity
            .record(
                Stage::AbandonmentDetector,
                "detect_abandonment",
                visitor.id.to_string(),
                if emitted { Outcome::Success } else { Outcome::Skipped },
                json!({
                    "step": visitor.abandonment_step,
                    "created": created,
                    "qualified": visitor.qualifies_for_reengagement(),
                    "lead_ready_emitted": emitted,
                }),
            )
            .await;

        Ok(visitor)
    }

    /// Mark visitors idle past the inactivity threshold as abandoned and
    /// emit `LeadReady` for those that qualify. Returns the ids marked.
    pub async fn sweep_inactive(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StageError> {
        let cutoff = now - self.inactivity_threshold;
        let idle = self.ctx.store.inactive_visitors(cutoff).await?;
        let mut marked = Vec::with_capacity(idle.len());

        for idle_visitor in idle {
            let (visitor, emitted) = self
                .ctx
                .modify_visitor(idle_visitor.id, |visitor| {
                    // Activity or abandonment may have landed since the scan.
                    if visitor.abandoned || visitor.last_activity_at >= cutoff {
                        return None;
                    }
                    visitor.abandoned = true;
                    visitor.updated_at = now;
                    Some(self.mark_lead_ready(visitor))
                })
                .await?;
            let Some(emitted) = emitted else {
                debug!(visitor_id = %visitor.id, "Visitor active again before sweep wrote");
                continue;
            };
            if emitted {
                self.emit_lead_ready(&visitor).await;
            }

            self.ctx
                .activity
                .record(
                    Stage::AbandonmentDetector,
                    "inactivity_sweep",
                    visitor.id.to_string(),
                    if emitted { Outcome::Success } else { Outcome::Skipped },
                    json!({
                        "step": visitor.abandonment_step,
                        "idle_since": visitor.last_activity_at,
                        "lead_ready_emitted": emitted,
                    }),
                )
                .await;
            marked.push(visitor.id);
        }

        if !marked.is_empty() {
            info!(count = marked.len(), "Inactive visitors marked abandoned");
        }
        Ok(marked)
    }

    /// Record that `LeadReady` is due for the current step. Fires at most
    /// once per (visitor, step).
    fn mark_lead_ready(&self, visitor: &mut Visitor) -> bool {
        if !visitor.qualifies_for_reengagement() {
            return false;
        }
        if visitor.lead_ready_step == Some(visitor.abandonment_step) {
            debug!(visitor_id = %visitor.id, step = visitor.abandonment_step, "LeadReady already emitted for step");
            return false;
        }
        visitor.lead_ready_step = Some(visitor.abandonment_step);
        true
    }

    async fn emit_lead_ready(&self, visitor: &Visitor) {
        self.ctx
            .emit(PipelineEvent::LeadReady {
                visitor_id: visitor.id,
                abandonment_step: visitor.abandonment_step,
            })
            .await;
    }
}
