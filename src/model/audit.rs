//! Audit log entries for operator visibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject_type", content = "subject_id", rename_all = "snake_case")]
pub enum AuditSubject {
    Campaign(Uuid),
    Message(Uuid),
}

impl AuditSubject {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Campaign(_) => "campaign",
            Self::Message(_) => "message",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Campaign(id) | Self::Message(id) => *id,
        }
    }
}

/// Recorded engine actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Launched,
    LaunchSkipped,
    PassScheduled,
    GenerationCompleted,
    GenerationSkipped,
    DispatchFailed,
    CampaignCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launched => "launched",
            Self::LaunchSkipped => "launch_skipped",
            Self::PassScheduled => "pass_scheduled",
            Self::GenerationCompleted => "generation_completed",
            Self::GenerationSkipped => "generation_skipped",
            Self::DispatchFailed => "dispatch_failed",
            Self::CampaignCompleted => "campaign_completed",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launched" => Ok(Self::Launched),
            "launch_skipped" => Ok(Self::LaunchSkipped),
            "pass_scheduled" => Ok(Self::PassScheduled),
            "generation_completed" => Ok(Self::GenerationCompleted),
            "generation_skipped" => Ok(Self::GenerationSkipped),
            "dispatch_failed" => Ok(Self::DispatchFailed),
            "campaign_completed" => Ok(Self::CampaignCompleted),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subject: AuditSubject,
    pub action: AuditAction,
    /// Structured detail (counts, resolved times, error text).
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        tenant_id: Uuid,
        subject: AuditSubject,
        action: AuditAction,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            subject,
            action,
            detail,
            created_at: Utc::now(),
        }
    }
}
