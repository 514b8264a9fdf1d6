//! Soft credit pull outcomes.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::PhoneNumber;

/// How long a cached result may be served.
pub const CREDIT_CACHE_TTL: Duration = Duration::minutes(5);

/// Raw answer from the external scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub approved: bool,
    pub score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Approved or declined, with the fields only meaningful for each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CreditDecision {
    Approved {
        approved_amount: Decimal,
        rate: Decimal,
    },
    Declined {
        reasons: Vec<String>,
    },
}

/// Outcome of a soft credit pull, cached by phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCheckResult {
    pub id: Uuid,
    pub phone: PhoneNumber,
    pub score: u32,
    pub decision: CreditDecision,
    pub cached_at: DateTime<Utc>,
}

impl CreditCheckResult {
    /// Build from a scorer response. An approval missing its terms is
    /// treated as a decline rather than invented.
    pub fn from_response(phone: PhoneNumber, response: ScoreResponse, at: DateTime<Utc>) -> Self {
        let decision = match (response.approved, response.approved_amount, response.rate) {
            (true, Some(approved_amount), Some(rate)) => CreditDecision::Approved {
                approved_amount,
                rate,
            },
            (true, _, _) => CreditDecision::Declined {
                reasons: vec!["incomplete_offer_terms".to_string()],
            },
            (false, _, _) => CreditDecision::Declined {
                reasons: response.reasons,
            },
        };
        Self {
            id: Uuid::new_v4(),
            phone,
            score: response.score,
            decision,
            cached_at: at,
        }
    }

    pub fn approved(&self) -> bool {
        matches!(self.decision, CreditDecision::Approved { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("5551234567").unwrap()
    }

    #[test]
    fn approved_response_carries_terms() {
        let result = CreditCheckResult::from_response(
            phone(),
            ScoreResponse {
                approved: true,
                score: 710,
                approved_amount: Some(dec!(25000)),
                rate: Some(dec!(6.9)),
                reasons: vec![],
            },
            Utc::now(),
        );
        assert!(result.approved());
        assert_eq!(
            result.decision,
            CreditDecision::Approved {
                approved_amount: dec!(25000),
                rate: dec!(6.9)
            }
        );
    }

    #[test]
    fn approval_without_terms_is_declined() {
        let result = CreditCheckResult::from_response(
            phone(),
            ScoreResponse {
                approved: true,
                score: 700,
                approved_amount: None,
                rate: None,
                reasons: vec![],
            },
            Utc::now(),
        );
        assert!(!result.approved());
    }

    #[test]
    fn declined_keeps_reasons() {
        let result = CreditCheckResult::from_response(
            phone(),
            ScoreResponse {
                approved: false,
                score: 540,
                approved_amount: None,
                rate: None,
                reasons: vec!["thin_file".into()],
            },
            Utc::now(),
        );
        assert_eq!(
            result.decision,
            CreditDecision::Declined {
                reasons: vec!["thin_file".into()]
            }
        );
    }
}
