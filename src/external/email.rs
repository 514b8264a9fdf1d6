//! Re-engagement message delivery over SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::EmailConfig;
use crate::error::ExternalError;
use crate::external::{MessageSender, SendReceipt};

const CAPABILITY: &str = "email";

/// SMTP sender. lettre's `SmtpTransport` is blocking, so each send runs on
/// the blocking pool.
pub struct SmtpSender {
    config: EmailConfig,
}

impl SmtpSender {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(
        &self,
        message_id: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, ExternalError> {
        Message::builder()
            .message_id(Some(message_id.to_string()))
            .from(self.config.from_address.parse().map_err(|e| {
                ExternalError::terminal(CAPABILITY, None, format!("Invalid from address: {e}"))
            })?)
            .to(to.parse().map_err(|e| {
                ExternalError::terminal(CAPABILITY, None, format!("Invalid to address: {e}"))
            })?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| {
                ExternalError::terminal(CAPABILITY, None, format!("Failed to build email: {e}"))
            })
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &str,
    ) -> Result<SendReceipt, ExternalError> {
        let message_id = format!("<{}@lead-pipeline>", Uuid::new_v4());
        let email = self.build_message(&message_id, address, subject, body)?;

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| ExternalError::transient(CAPABILITY, format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.expose_secret().to_string(),
            ))
            .build();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| ExternalError::transient(CAPABILITY, format!("send task failed: {e}")))?
            .map_err(|e| {
                if e.is_permanent() {
                    ExternalError::terminal(CAPABILITY, None, format!("SMTP send failed: {e}"))
                } else {
                    ExternalError::transient(CAPABILITY, format!("SMTP send failed: {e}"))
                }
            })?;

        tracing::info!(message_id = %message_id, "Re-engagement email sent");
        Ok(SendReceipt {
            provider_message_id: Some(message_id),
        })
    }
}

/// Sender used when SMTP is not configured. Logs the send (address domain
/// only) and reports success.
#[derive(Debug, Default)]
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        _body: &str,
    ) -> Result<SendReceipt, ExternalError> {
        let domain = address.rsplit_once('@').map(|(_, d)| d).unwrap_or("?");
        let message_id = format!("log-{}", Uuid::new_v4());
        tracing::info!(
            domain,
            subject,
            message_id = %message_id,
            "SMTP not configured; message logged instead of sent"
        );
        Ok(SendReceipt {
            provider_message_id: Some(message_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn sender() -> SmtpSender {
        SmtpSender::new(EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "bot@example.com".into(),
            password: SecretString::from("pw"),
            from_address: "Loans <bot@example.com>".into(),
        })
    }

    #[test]
    fn builds_message_with_given_id() {
        let message = sender()
            .build_message("<abc@lead-pipeline>", "a@b.com", "Pick up where you left off", "hi")
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Message-ID: <abc@lead-pipeline>"));
        assert!(raw.contains("To: a@b.com"));
    }

    #[test]
    fn bad_recipient_is_terminal() {
        let err = sender()
            .build_message("<x@y>", "not an address", "s", "b")
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn logging_sender_reports_success() {
        let receipt = LoggingSender.send("a@b.com", "subject", "body").await.unwrap();
        assert!(receipt.provider_message_id.unwrap().starts_with("log-"));
    }
}
