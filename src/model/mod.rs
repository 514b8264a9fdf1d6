//! Pipeline data model: visitors, return tokens, credit results and leads.

pub mod credit;
pub mod lead;
pub mod phone;
pub mod token;
pub mod visitor;

pub use credit::{CREDIT_CACHE_TTL, CreditCheckResult, CreditDecision, ScoreResponse};
pub use lead::{
    CreditSummary, DeadLetterEntry, EngagementSnapshot, Lead, LeadSnapshot, LeadStatus,
    VisitorSnapshot,
};
pub use phone::PhoneNumber;
pub use token::{RETURN_TOKEN_TTL, ReturnToken};
pub use visitor::{CreditStatus, EmailHash, Visitor};
