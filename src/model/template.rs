//! Template data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::lead::Channel;

/// Rendering source for one channel. Resolved from the step or the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub channel: Channel,
    /// Email subject line; unused for SMS/WhatsApp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        tenant_id: Uuid,
        name: impl Into<String>,
        channel: Channel,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            channel,
            subject: None,
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    /// Builder: set the subject line.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Output of the template renderer for one lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}
