//! Channel providers: the dispatch seam between the engine and the outside
//! world.
//!
//! A provider either accepts a message (optionally with its own message id),
//! rejects it (terminal, the address or payload is bad), or fails with a
//! transport error (retryable). The engine maps those three outcomes onto the
//! message state machine.

pub mod smtp;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::model::{Channel, MessageStatus, OutboundMessage};

pub use smtp::SmtpDispatcher;
pub use webhook::WebhookDispatcher;

/// Provider verdict for one dispatched message.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Whether the provider took responsibility for the message.
    pub accepted: bool,
    /// Status to record on acceptance. `Sent` unless the provider confirms
    /// further progress synchronously.
    pub status: MessageStatus,
    /// Provider-side id for delivery-event correlation.
    pub provider_message_id: Option<String>,
    /// Rejection detail when `accepted` is false.
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn accepted(provider_message_id: Option<String>) -> Self {
        Self {
            accepted: true,
            status: MessageStatus::Sent,
            provider_message_id,
            error: None,
        }
    }

    /// Terminal rejection; the engine will not retry.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            status: MessageStatus::Failed,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// One outbound provider. `Err` means a transport problem worth retrying;
/// a rejection is an `Ok` result with `accepted == false`.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Provider name recorded on the message row.
    fn name(&self) -> &str;

    async fn dispatch(&self, message: &OutboundMessage) -> Result<DispatchResult, DispatchError>;
}

/// Channel-to-dispatcher lookup shared by the dispatch service.
#[derive(Default, Clone)]
pub struct DispatcherRegistry {
    dispatchers: HashMap<Channel, Arc<dyn MessageDispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Channel, dispatcher: Arc<dyn MessageDispatcher>) {
        self.dispatchers.insert(channel, dispatcher);
    }

    /// Builder form for startup wiring.
    pub fn with(mut self, channel: Channel, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.register(channel, dispatcher);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn MessageDispatcher>> {
        self.dispatchers.get(&channel).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Channels with a registered dispatcher.
    pub fn channels(&self) -> Vec<Channel> {
        self.dispatchers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    #[async_trait]
    impl MessageDispatcher for Null {
        fn name(&self) -> &str {
            "null"
        }

        async fn dispatch(
            &self,
            _message: &OutboundMessage,
        ) -> Result<DispatchResult, DispatchError> {
            Ok(DispatchResult::accepted(None))
        }
    }

    #[test]
    fn registry_lookup_by_channel() {
        let registry = DispatcherRegistry::new().with(Channel::Email, Arc::new(Null));
        assert!(registry.get(Channel::Email).is_some());
        assert!(registry.get(Channel::Sms).is_none());
        assert_eq!(registry.channels(), vec![Channel::Email]);
    }
}
