//! Campaign launch: turns a campaign definition into persisted generation
//! passes.
//!
//! Launch is guarded by `launched_at`: the first caller wins, every later call
//! is an audited no-op that schedules nothing. Passes are rows in the job
//! queue with absolute `run_at` times, so a drip wave due next week survives
//! restarts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::model::{
    AuditAction, AuditEntry, AuditSubject, Campaign, CampaignStatus, CampaignStep, CampaignType,
};
use crate::store::Database;
use crate::worker::{JobKind, QueuedJob};

/// Schedules generation passes for launched campaigns.
pub struct CampaignScheduler {
    db: Arc<dyn Database>,
}

impl CampaignScheduler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Launch a campaign now. Returns the number of generation passes
    /// scheduled (0 for an audited no-op).
    pub async fn launch(&self, tenant_id: Uuid, campaign_id: Uuid) -> Result<u32> {
        self.launch_at(tenant_id, campaign_id, Utc::now()).await
    }

    /// Launch with an explicit clock, for deterministic scheduling in tests.
    pub async fn launch_at(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let campaign = self
            .db
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "campaign".into(),
                id: campaign_id.to_string(),
            })?;

        if campaign.status.is_terminal_for_generation() {
            return self
                .skip(&campaign, json!({ "reason": campaign.status.as_str() }))
                .await;
        }

        // Launch guard: only the first call past this point schedules passes.
        if !self
            .db
            .mark_campaign_launched(tenant_id, campaign_id, now)
            .await?
        {
            return self
                .skip(&campaign, json!({ "reason": "already_launched" }))
                .await;
        }

        // A start time in the past collapses to now; never schedule backwards.
        let effective_start = match campaign.start_at {
            Some(start) if start > now => start,
            _ => now,
        };

        let passes = match campaign.campaign_type {
            CampaignType::Drip => {
                self.schedule_drip_passes(&campaign, effective_start).await?
            }
            CampaignType::Broadcast | CampaignType::Scheduled => {
                self.schedule_pass(&campaign, None, effective_start).await?;
                1
            }
        };

        self.db
            .set_campaign_status_if(
                tenant_id,
                campaign_id,
                &[CampaignStatus::Draft],
                CampaignStatus::Scheduled,
            )
            .await?;

        self.db
            .insert_audit(&AuditEntry::new(
                tenant_id,
                AuditSubject::Campaign(campaign_id),
                AuditAction::Launched,
                json!({
                    "passes": passes,
                    "effective_start": effective_start.to_rfc3339(),
                }),
            ))
            .await?;

        tracing::info!(
            campaign = %campaign_id,
            passes,
            start = %effective_start,
            "Campaign launched"
        );

        Ok(passes)
    }

    /// One pass per active step. A drip campaign that has no steps yet gets a
    /// default immediate step so launch always produces at least one wave.
    async fn schedule_drip_passes(
        &self,
        campaign: &Campaign,
        effective_start: DateTime<Utc>,
    ) -> Result<u32> {
        let mut steps = self
            .db
            .list_active_steps(campaign.tenant_id, campaign.id)
            .await?;

        if steps.is_empty() {
            let step = CampaignStep::new(campaign, 0, campaign.channel, 0);
            self.db.insert_step(&step).await?;
            steps.push(step);
        }

        let mut passes = 0u32;
        for step in &steps {
            let run_at = effective_start + Duration::minutes(i64::from(step.delay_minutes));
            self.schedule_pass(campaign, Some(step.id), run_at).await?;
            passes += 1;
        }
        Ok(passes)
    }

    async fn schedule_pass(
        &self,
        campaign: &Campaign,
        step_id: Option<Uuid>,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let job = QueuedJob::new(
            campaign.tenant_id,
            JobKind::Generate {
                campaign_id: campaign.id,
                step_id,
            },
            run_at,
        );
        self.db.enqueue_job(&job).await?;

        self.db
            .insert_audit(&AuditEntry::new(
                campaign.tenant_id,
                AuditSubject::Campaign(campaign.id),
                AuditAction::PassScheduled,
                json!({
                    "job_id": job.id,
                    "step_id": step_id,
                    "run_at": run_at.to_rfc3339(),
                }),
            ))
            .await?;
        Ok(())
    }

    async fn skip(&self, campaign: &Campaign, detail: serde_json::Value) -> Result<u32> {
        tracing::info!(campaign = %campaign.id, %detail, "Launch skipped");
        self.db
            .insert_audit(&AuditEntry::new(
                campaign.tenant_id,
                AuditSubject::Campaign(campaign.id),
                AuditAction::LaunchSkipped,
                detail,
            ))
            .await?;
        Ok(0)
    }
}
