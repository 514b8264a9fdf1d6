//! JSON-over-HTTP adapters for the credit scorer and the dealer CRM.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::config::HttpEndpointConfig;
use crate::error::ExternalError;
use crate::external::{CreditScorer, CrmResponse, CrmSubmitter};
use crate::model::{PhoneNumber, ScoreResponse};

fn client(timeout: Duration) -> Result<reqwest::Client, ExternalError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ExternalError::terminal("http", None, format!("client build failed: {e}")))
}

fn transport_error(capability: &str, timeout: Duration, e: reqwest::Error) -> ExternalError {
    if e.is_timeout() {
        ExternalError::Timeout {
            capability: capability.to_string(),
            timeout,
        }
    } else {
        ExternalError::transient(capability, e.to_string())
    }
}

// ── Credit scorer ───────────────────────────────────────────────────

/// POSTs `{"phone": "+1..."}` and expects a [`ScoreResponse`] body.
pub struct HttpCreditScorer {
    endpoint: HttpEndpointConfig,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCreditScorer {
    pub fn new(endpoint: HttpEndpointConfig, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            client: client(timeout)?,
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl CreditScorer for HttpCreditScorer {
    async fn score(&self, phone: &PhoneNumber) -> Result<ScoreResponse, ExternalError> {
        let resp = self
            .client
            .post(&self.endpoint.url)
            .bearer_auth(self.endpoint.api_key.expose_secret())
            .json(&json!({ "phone": phone.as_str() }))
            .send()
            .await
            .map_err(|e| transport_error("scorer", self.timeout, e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(ExternalError::transient("scorer", format!("status {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::terminal(
                "scorer",
                Some(status.as_u16()),
                body.chars().take(200).collect::<String>(),
            ));
        }

        resp.json::<ScoreResponse>().await.map_err(|e| {
            ExternalError::terminal("scorer", Some(status.as_u16()), format!("malformed body: {e}"))
        })
    }
}

// ── CRM ─────────────────────────────────────────────────────────────

/// POSTs the lead snapshot as JSON and hands back the raw status and body.
pub struct HttpCrmSubmitter {
    endpoint: HttpEndpointConfig,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCrmSubmitter {
    pub fn new(endpoint: HttpEndpointConfig, timeout: Duration) -> Result<Self, ExternalError> {
        Ok(Self {
            client: client(timeout)?,
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl CrmSubmitter for HttpCrmSubmitter {
    async fn submit(&self, payload: &serde_json::Value) -> Result<CrmResponse, ExternalError> {
        let resp = self
            .client
            .post(&self.endpoint.url)
            .bearer_auth(self.endpoint.api_key.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error("crm", self.timeout, e))?;

        let status_code = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error("crm", self.timeout, e))?;
        Ok(CrmResponse { status_code, body })
    }
}
