//! JSON-webhook dispatcher for SMS and WhatsApp gateways.
//!
//! Posts one JSON payload per message to the configured gateway endpoint.
//! 2xx means accepted (the gateway may echo its own message id), 4xx is a
//! terminal rejection, anything else is a retryable transport error.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::WebhookGatewayConfig;
use crate::error::DispatchError;
use crate::model::OutboundMessage;
use crate::providers::{DispatchResult, MessageDispatcher};

/// Gateway acknowledgement body. All fields optional; gateways differ.
#[derive(Debug, Default, Deserialize)]
struct GatewayAck {
    #[serde(default, alias = "id")]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Dispatches via HTTP POST to a message gateway.
pub struct WebhookDispatcher {
    name: String,
    config: WebhookGatewayConfig,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(name: impl Into<String>, config: WebhookGatewayConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageDispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, message: &OutboundMessage) -> Result<DispatchResult, DispatchError> {
        let payload = serde_json::json!({
            "message_id": message.id,
            "channel": message.channel.as_str(),
            "to": message.destination,
            "body": message.body,
        });

        let mut request = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| DispatchError::Transport {
            provider: self.name.clone(),
            reason: format!("Gateway request failed: {e}"),
        })?;

        let status = response.status();
        let ack: GatewayAck = response.json().await.unwrap_or_default();

        if status.is_success() {
            tracing::info!(
                message = %message.id,
                provider = %self.name,
                "Gateway accepted message"
            );
            return Ok(DispatchResult::accepted(ack.message_id));
        }

        if status.is_client_error() {
            let detail = ack.error.unwrap_or_else(|| status.to_string());
            return Ok(DispatchResult::rejected(format!(
                "Gateway rejected: {detail}"
            )));
        }

        Err(DispatchError::Transport {
            provider: self.name.clone(),
            reason: format!("Gateway error: {status}"),
        })
    }
}
