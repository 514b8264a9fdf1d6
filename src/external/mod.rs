//! Narrow capability interfaces to the outside world.
//!
//! Stages depend only on these traits. Concrete adapters live in
//! `email` (SMTP via lettre) and `http` (JSON over reqwest).

pub mod email;
pub mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalError;
use crate::model::{PhoneNumber, ScoreResponse};

pub use email::{LoggingSender, SmtpSender};
pub use http::{HttpCreditScorer, HttpCrmSubmitter};

/// Accepted by the message provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}

/// Outbound message delivery (re-engagement emails).
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<SendReceipt, ExternalError>;
}

/// Soft credit pull.
#[async_trait]
pub trait CreditScorer: Send + Sync {
    async fn score(&self, phone: &PhoneNumber) -> Result<ScoreResponse, ExternalError>;
}

/// Raw CRM answer. Transport failures are reported as `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmResponse {
    pub status_code: u16,
    pub body: String,
}

impl CrmResponse {
    /// 2xx yields the confirmation reference, 5xx is retryable, anything
    /// else is terminal.
    pub fn interpret(&self) -> Result<String, ExternalError> {
        match self.status_code {
            200..=299 => Ok(self.reference()),
            500..=599 => Err(ExternalError::transient(
                "crm",
                format!("status {}", self.status_code),
            )),
            status => Err(ExternalError::terminal(
                "crm",
                Some(status),
                truncate(&self.body, 200),
            )),
        }
    }

    /// `reference` or `id` from a JSON body, else the trimmed body itself.
    fn reference(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                ["reference", "id"]
                    .iter()
                    .find_map(|k| v.get(k).and_then(json_scalar))
            })
            .unwrap_or_else(|| truncate(self.body.trim(), 200))
    }
}

fn json_scalar(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Lead delivery to the dealer CRM.
#[async_trait]
pub trait CrmSubmitter: Send + Sync {
    async fn submit(&self, payload: &serde_json::Value) -> Result<CrmResponse, ExternalError>;
}

/// Bound an outbound call. Elapsed deadlines become [`ExternalError::Timeout`].
pub async fn with_timeout<T, F>(
    capability: &str,
    timeout: Duration,
    call: F,
) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::Timeout {
            capability: capability.to_string(),
            timeout,
        }),
    }
}
