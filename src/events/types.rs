//! Typed pipeline events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CreditCheckResult, PhoneNumber};

/// Every event a stage can emit. Each stage consumes exactly one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A visitor qualified for re-engagement.
    LeadReady {
        visitor_id: Uuid,
        abandonment_step: u32,
    },
    MessageSent {
        visitor_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_message_id: Option<String>,
        token_expires_at: DateTime<Utc>,
    },
    CreditCheckRequested {
        visitor_id: Uuid,
        phone: PhoneNumber,
    },
    CreditApproved {
        visitor_id: Uuid,
        result: CreditCheckResult,
    },
    CreditDeclined {
        visitor_id: Uuid,
        result: CreditCheckResult,
    },
    LeadSubmitted {
        lead_id: Uuid,
        visitor_id: Uuid,
        reference: String,
    },
    LeadDeadLettered {
        lead_id: Uuid,
        visitor_id: Uuid,
        error: String,
    },
}

/// Discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LeadReady,
    MessageSent,
    CreditCheckRequested,
    CreditApproved,
    CreditDeclined,
    LeadSubmitted,
    LeadDeadLettered,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::LeadReady,
        Self::MessageSent,
        Self::CreditCheckRequested,
        Self::CreditApproved,
        Self::CreditDeclined,
        Self::LeadSubmitted,
        Self::LeadDeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadReady => "lead_ready",
            Self::MessageSent => "message_sent",
            Self::CreditCheckRequested => "credit_check_requested",
            Self::CreditApproved => "credit_approved",
            Self::CreditDeclined => "credit_declined",
            Self::LeadSubmitted => "lead_submitted",
            Self::LeadDeadLettered => "lead_dead_lettered",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LeadReady { .. } => EventKind::LeadReady,
            Self::MessageSent { .. } => EventKind::MessageSent,
            Self::CreditCheckRequested { .. } => EventKind::CreditCheckRequested,
            Self::CreditApproved { .. } => EventKind::CreditApproved,
            Self::CreditDeclined { .. } => EventKind::CreditDeclined,
            Self::LeadSubmitted { .. } => EventKind::LeadSubmitted,
            Self::LeadDeadLettered { .. } => EventKind::LeadDeadLettered,
        }
    }

    /// The visitor whose journey this event belongs to.
    pub fn visitor_id(&self) -> Uuid {
        match self {
            Self::LeadReady { visitor_id, .. }
            | Self::MessageSent { visitor_id, .. }
            | Self::CreditCheckRequested { visitor_id, .. }
            | Self::CreditApproved { visitor_id, .. }
            | Self::CreditDeclined { visitor_id, .. }
            | Self::LeadSubmitted { visitor_id, .. }
            | Self::LeadDeadLettered { visitor_id, .. } => *visitor_id,
        }
    }
}

/// An event plus delivery metadata. The id lets consumers dedupe redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

impl EventEnvelope {
    pub fn new(event: PipelineEvent, emitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_is_tagged() {
        let event = PipelineEvent::LeadReady {
            visitor_id: Uuid::nil(),
            abandonment_step: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "lead_ready");
        assert_eq!(json["abandonment_step"], 3);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let event = PipelineEvent::CreditCheckRequested {
            visitor_id: Uuid::nil(),
            phone: PhoneNumber::parse("5551234567").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.kind().as_str());
    }

    #[test]
    fn envelope_flattens_event() {
        let envelope = EventEnvelope::new(
            PipelineEvent::LeadSubmitted {
                lead_id: Uuid::nil(),
                visitor_id: Uuid::nil(),
                reference: "CRM-1".into(),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "lead_submitted");
        assert_eq!(json["reference"], "CRM-1");
        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
