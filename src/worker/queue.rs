//! Job queue types.
//!
//! Jobs are persisted rows, not in-process tasks: a generation pass scheduled
//! for next week must survive a restart. Execution is at-least-once; the
//! operations behind each kind are idempotent (dedup key for generation,
//! status guard for dispatch), so a re-run after a crash is safe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a queued job does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// One generation pass for a campaign and optional drip step.
    Generate {
        campaign_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<Uuid>,
    },
    /// Dispatch one queued message.
    Dispatch { message_id: Uuid },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate",
            Self::Dispatch { .. } => "dispatch",
        }
    }
}

/// Queue-level job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One persisted queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: JobKind,
    /// Absolute earliest execution time.
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Create a pending job due at `run_at`.
    pub fn new(tenant_id: Uuid, kind: JobKind, run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            kind,
            run_at,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a job due immediately.
    pub fn immediate(tenant_id: Uuid, kind: JobKind) -> Self {
        Self::new(tenant_id, kind, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serde_roundtrip() {
        let kind = JobKind::Generate {
            campaign_id: Uuid::new_v4(),
            step_id: None,
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(serde_json::from_str::<JobKind>(&json).unwrap(), kind);

        let kind = JobKind::Dispatch {
            message_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(serde_json::from_str::<JobKind>(&json).unwrap(), kind);
    }
}
