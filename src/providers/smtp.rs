//! SMTP email dispatcher via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::DispatchError;
use crate::model::OutboundMessage;
use crate::providers::{DispatchResult, MessageDispatcher};

/// Sends email messages through an SMTP relay.
pub struct SmtpDispatcher {
    config: SmtpConfig,
}

impl SmtpDispatcher {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_transport(&self) -> Result<SmtpTransport, DispatchError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        Ok(SmtpTransport::relay(&self.config.host)
            .map_err(|e| DispatchError::Transport {
                provider: "smtp".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl MessageDispatcher for SmtpDispatcher {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn dispatch(&self, message: &OutboundMessage) -> Result<DispatchResult, DispatchError> {
        let to = match message.destination.parse() {
            Ok(to) => to,
            // A malformed address never becomes deliverable; reject.
            Err(e) => return Ok(DispatchResult::rejected(format!("Invalid to address: {e}"))),
        };

        let from = self.config.from_address.parse().map_err(|e| {
            DispatchError::Transport {
                provider: "smtp".into(),
                reason: format!("Invalid from address: {e}"),
            }
        })?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.as_deref().unwrap_or_default())
            .body(message.body.clone())
            .map_err(|e| DispatchError::Transport {
                provider: "smtp".into(),
                reason: format!("Failed to build email: {e}"),
            })?;

        let transport = self.build_transport()?;
        match transport.send(&email) {
            Ok(response) => {
                tracing::info!(message = %message.id, to = %message.destination, "Email sent");
                let provider_message_id = response.message().next().map(str::to_string);
                Ok(DispatchResult::accepted(provider_message_id))
            }
            // Permanent SMTP failures (5xx) are the server refusing this
            // message; transient ones bubble up as transport errors.
            Err(e) if e.is_permanent() => {
                Ok(DispatchResult::rejected(format!("SMTP rejected: {e}")))
            }
            Err(e) => Err(DispatchError::Transport {
                provider: "smtp".into(),
                reason: format!("SMTP send failed: {e}"),
            }),
        }
    }
}
