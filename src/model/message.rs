//! Outbound message data model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::lead::Channel;

/// Message lifecycle status.
///
/// `Queued` is the only state from which dispatch is attempted. Transitions
/// past `Sent` come from provider delivery events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Sent | Self::Failed)
                | (
                    Self::Sent,
                    Self::Delivered | Self::Opened | Self::Clicked | Self::Failed
                )
                | (Self::Delivered, Self::Opened | Self::Clicked)
                | (Self::Opened, Self::Clicked)
        )
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "opened" => Ok(Self::Opened),
            "clicked" => Ok(Self::Clicked),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// One outbound message row.
///
/// At most one outbound message exists per
/// (tenant, campaign, step-or-null, lead, channel). An immutable audit record
/// apart from its status fields; only the reconciler mutates it after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    pub lead_id: Uuid,
    pub channel: Channel,
    pub status: MessageStatus,
    /// Email address or phone number; empty when the lead had none at render time.
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Dispatch attempts so far, counted by the transport-retry path.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clicked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a queued message for one admitted recipient.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        tenant_id: Uuid,
        campaign_id: Uuid,
        step_id: Option<Uuid>,
        lead_id: Uuid,
        channel: Channel,
        destination: impl Into<String>,
        subject: Option<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id,
            step_id,
            lead_id,
            channel,
            status: MessageStatus::Queued,
            destination: destination.into(),
            subject,
            body: body.into(),
            provider: None,
            provider_message_id: None,
            error_message: None,
            attempt_count: 0,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_only_goes_to_sent_or_failed() {
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Failed));
        assert!(!MessageStatus::Queued.can_transition_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Queued.can_transition_to(MessageStatus::Opened));
    }

    #[test]
    fn sent_accepts_delivery_events() {
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Opened));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Clicked));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Failed));
    }

    #[test]
    fn failed_is_terminal_in_the_state_machine() {
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Queued));
    }
}
