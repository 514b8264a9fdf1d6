//! Lead state machine and the frozen snapshot submitted to the CRM.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CreditCheckResult, CreditDecision, EmailHash, PhoneNumber, ReturnToken, Visitor};

/// Submission state of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Packaged, never submitted.
    Pending,
    /// A submission is in flight.
    Processing,
    Submitted,
    /// Rejected by the CRM (4xx). Can be retried manually.
    Failed,
    /// Retry budget exhausted.
    DeadLettered,
}

impl LeadStatus {
    /// Forward-only, except re-entering `Processing` on retry.
    pub fn can_transition_to(&self, target: LeadStatus) -> bool {
        use LeadStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Submitted)
                | (Processing, Failed)
                | (Processing, DeadLettered)
                | (Failed, Processing)
                | (DeadLettered, Processing)
        )
    }

    /// States from which a new submission may start.
    pub const SUBMITTABLE: [LeadStatus; 3] = [Self::Pending, Self::Failed, Self::DeadLettered];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Submitted | Self::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "submitted" => Ok(Self::Submitted),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("Unknown lead status: {s}")),
        }
    }
}

/// Visitor fields as they were at packaging time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorSnapshot {
    pub visitor_id: Uuid,
    pub email_hash: EmailHash,
    pub session_id: String,
    pub abandonment_step: u32,
    pub phone: Option<PhoneNumber>,
    pub metadata: BTreeMap<String, String>,
}

/// What the re-engagement stage achieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub token_issued_at: Option<DateTime<Utc>>,
    pub message_sent: bool,
    pub returned_at: Option<DateTime<Utc>>,
}

/// Credit terms carried on the lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditSummary {
    pub credit_check_id: Uuid,
    pub score: u32,
    pub approved_amount: Decimal,
    pub rate: Decimal,
    pub checked_at: DateTime<Utc>,
}

/// Immutable payload assembled from every prior stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub visitor: VisitorSnapshot,
    pub engagement: EngagementSnapshot,
    pub credit: CreditSummary,
    pub packaged_at: DateTime<Utc>,
}

impl LeadSnapshot {
    /// Returns `None` when the credit result is not an approval.
    pub fn assemble(
        visitor: &Visitor,
        token: Option<&ReturnToken>,
        credit: &CreditCheckResult,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let CreditDecision::Approved {
            approved_amount,
            rate,
        } = &credit.decision
        else {
            return None;
        };

        Some(Self {
            visitor: VisitorSnapshot {
                visitor_id: visitor.id,
                email_hash: visitor.email_hash.clone(),
                session_id: visitor.session_id.clone(),
                abandonment_step: visitor.abandonment_step,
                phone: visitor.phone_number.clone(),
                metadata: visitor.metadata.clone(),
            },
            engagement: EngagementSnapshot {
                token_issued_at: token.map(|t| t.issued_at),
                message_sent: token.is_some_and(|t| t.message_sent),
                returned_at: token.and_then(|t| t.redeemed_at),
            },
            credit: CreditSummary {
                credit_check_id: credit.id,
                score: credit.score,
                approved_amount: *approved_amount,
                rate: *rate,
                checked_at: credit.cached_at,
            },
            packaged_at: now,
        })
    }
}

/// Terminal work item submitted to the dealer CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub visitor_id: Uuid,
    pub credit_check_id: Uuid,
    pub data: LeadSnapshot,
    pub status: LeadStatus,
    /// CRM confirmation reference, once submitted.
    pub external_reference: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn new(data: LeadSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            visitor_id: data.visitor.visitor_id,
            credit_check_id: data.credit.credit_check_id,
            status: LeadStatus::Pending,
            external_reference: None,
            attempts: 0,
            last_error: None,
            created_at: data.packaged_at,
            updated_at: data.packaged_at,
            submitted_at: None,
            data,
        }
    }
}

/// A lead parked after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub lead_id: Uuid,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScoreResponse;
    use rust_decimal_macros::dec;

    #[test]
    fn status_transitions() {
        use LeadStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(DeadLettered));
        assert!(Failed.can_transition_to(Processing));
        assert!(DeadLettered.can_transition_to(Processing));

        assert!(!Pending.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Submitted));
    }

    #[test]
    fn status_string_roundtrip() {
        for s in [
            LeadStatus::Pending,
            LeadStatus::Processing,
            LeadStatus::Submitted,
            LeadStatus::Failed,
            LeadStatus::DeadLettered,
        ] {
            assert_eq!(s.as_str().parse::<LeadStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn snapshot_is_frozen_at_packaging() {
        let now = Utc::now();
        let mut visitor = Visitor::new(EmailHash::from_email("a@b.com").unwrap(), "s1", 3, now);
        visitor.metadata.insert("vehicle_type".into(), "suv".into());
        let credit = CreditCheckResult::from_response(
            PhoneNumber::parse("5551234567").unwrap(),
            ScoreResponse {
                approved: true,
                score: 710,
                approved_amount: Some(dec!(20000)),
                rate: Some(dec!(7.5)),
                reasons: vec![],
            },
            now,
        );

        let snapshot = LeadSnapshot::assemble(&visitor, None, &credit, now).unwrap();
        visitor.abandonment_step = 5;
        visitor.metadata.insert("vehicle_type".into(), "truck".into());

        assert_eq!(snapshot.visitor.abandonment_step, 3);
        assert_eq!(snapshot.visitor.metadata["vehicle_type"], "suv");
        assert_eq!(snapshot.credit.approved_amount, dec!(20000));
        assert!(!snapshot.engagement.message_sent);
    }

    #[test]
    fn snapshot_refuses_declined_credit() {
        let now = Utc::now();
        let visitor = Visitor::new(EmailHash::from_email("a@b.com").unwrap(), "s1", 3, now);
        let credit = CreditCheckResult::from_response(
            PhoneNumber::parse("5551234567").unwrap(),
            ScoreResponse {
                approved: false,
                score: 500,
                approved_amount: None,
                rate: None,
                reasons: vec!["score_too_low".into()],
            },
            now,
        );
        assert!(LeadSnapshot::assemble(&visitor, None, &credit, now).is_none());
    }
}
