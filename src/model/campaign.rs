//! Campaign data model: campaigns, steps, and stop-rule settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::lead::Channel;

/// How a campaign paces its message waves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    /// One immediate generation pass.
    Broadcast,
    /// One generation pass at the configured start time.
    Scheduled,
    /// One generation pass per active step, each at its own delay.
    Drip,
}

impl CampaignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Scheduled => "scheduled",
            Self::Drip => "drip",
        }
    }
}

impl std::str::FromStr for CampaignType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(Self::Broadcast),
            "scheduled" => Ok(Self::Scheduled),
            "drip" => Ok(Self::Drip),
            other => Err(format!("unknown campaign type: {other}")),
        }
    }
}

/// Campaign lifecycle status.
///
/// Paused and Completed campaigns never produce new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    /// Whether this status blocks generation and launch.
    pub fn is_terminal_for_generation(&self) -> bool {
        matches!(self, Self::Paused | Self::Completed)
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Per-campaign suppression rule toggles.
///
/// Each rule only applies when its flag is set; an absent flag skips the rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRuleSettings {
    /// Stop when the lead has an active unsubscribe for the channel.
    #[serde(default)]
    pub opt_out: bool,
    /// Stop when the lead is in a terminal deal status (won or lost).
    #[serde(default)]
    pub won_lost: bool,
    /// Stop when the lead has replied on the channel since the campaign began.
    #[serde(default)]
    pub replied: bool,
    /// Stop when the outbound count reaches the fatigue threshold.
    #[serde(default)]
    pub fatigue: bool,
    /// Outbound sends on the channel before fatigue kicks in.
    #[serde(default)]
    pub fatigue_threshold: u32,
    /// Extra sends permitted past the threshold before the terminal sunset stop.
    #[serde(default)]
    pub reengagement_allowance: u32,
    /// Rolling window for the fatigue count; `None` counts since campaign start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatigue_window_days: Option<u32>,
}

/// A campaign is the unit of audience + template + pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    /// Default channel when neither step nor template pins one.
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// Set exactly once by the scheduler; guards against double launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
    pub stop_rules: StopRuleSettings,
    /// Soft-retire marker; archived campaigns are hidden, never deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign.
    pub fn new(
        tenant_id: Uuid,
        name: impl Into<String>,
        campaign_type: CampaignType,
        channel: Channel,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            campaign_type,
            status: CampaignStatus::Draft,
            channel,
            segment_id: None,
            template_id: None,
            start_at: None,
            end_at: None,
            launched_at: None,
            stop_rules: StopRuleSettings::default(),
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the audience segment.
    pub fn with_segment(mut self, segment_id: Uuid) -> Self {
        self.segment_id = Some(segment_id);
        self
    }

    /// Builder: set the default template.
    pub fn with_template(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }

    /// Builder: set the scheduled start time.
    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    /// Builder: set stop-rule settings.
    pub fn with_stop_rules(mut self, stop_rules: StopRuleSettings) -> Self {
        self.stop_rules = stop_rules;
        self
    }
}

/// One step of a drip campaign.
///
/// Steps are evaluated independently; each generates its own message wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    /// Ordering position within the campaign.
    pub position: u32,
    pub channel: Channel,
    /// Delay from the campaign's effective start, in minutes. Always >= 0.
    pub delay_minutes: u32,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CampaignStep {
    pub fn new(campaign: &Campaign, position: u32, channel: Channel, delay_minutes: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: campaign.tenant_id,
            campaign_id: campaign.id,
            position,
            channel,
            delay_minutes,
            active: true,
            template_id: None,
            created_at: Utc::now(),
        }
    }

    /// Builder: set a step-specific template.
    pub fn with_template(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }
}
