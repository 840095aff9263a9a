//! Unified `Database` trait: single async interface for all persistence.
//!
//! The engine components (scheduler, generator, dispatch) only ever see this
//! trait, so they are testable against any backend. All methods take an
//! explicit `tenant_id`; there is no ambient tenant context anywhere.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AuditEntry, AuditSubject, Campaign, CampaignStatus, CampaignStep, Channel, Lead,
    MessageStatus, OutboundMessage, Segment, Template,
};
use crate::worker::queue::QueuedJob;

/// Backend-agnostic database trait covering campaigns, leads, messages,
/// suppression history, audit entries, and the job queue.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    /// Insert a new campaign.
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    /// Get a campaign by id.
    async fn get_campaign(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Campaign>, DatabaseError>;

    /// Unconditionally set a campaign's status.
    async fn set_campaign_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    /// Compare-and-set: move to `to` only while the status is one of `from`.
    /// Returns whether the transition happened.
    async fn set_campaign_status_if(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool, DatabaseError>;

    /// Set `launched_at` if it is still unset. Returns whether this call won.
    async fn mark_campaign_launched(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Soft-retire a campaign.
    async fn archive_campaign(&self, tenant_id: Uuid, id: Uuid) -> Result<(), DatabaseError>;

    // ── Campaign steps ──────────────────────────────────────────────

    /// Insert a drip step.
    async fn insert_step(&self, step: &CampaignStep) -> Result<(), DatabaseError>;

    /// Active steps of a campaign, ordered by position.
    async fn list_active_steps(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignStep>, DatabaseError>;

    /// Get one step by id.
    async fn get_step(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<CampaignStep>, DatabaseError>;

    // ── Segments ────────────────────────────────────────────────────

    async fn insert_segment(&self, segment: &Segment) -> Result<(), DatabaseError>;

    async fn get_segment(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Segment>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    /// One page of leads in stable id-ascending order, starting strictly
    /// after `after` (keyset pagination). Segment predicates are applied by
    /// the resolver on top of this stream.
    async fn list_leads_page(
        &self,
        tenant_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &Template) -> Result<(), DatabaseError>;

    async fn get_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Template>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a queued outbound message. Returns `false` when the dedup key
    /// (tenant, campaign, step-or-null, lead, channel) already exists.
    async fn insert_message(&self, message: &OutboundMessage) -> Result<bool, DatabaseError>;

    async fn get_message(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Dedup-key existence check used by the generator before rendering.
    async fn message_exists(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        step_id: Option<Uuid>,
        lead_id: Uuid,
        channel: Channel,
    ) -> Result<bool, DatabaseError>;

    /// Record a successful dispatch: provider-reported status plus metadata.
    async fn mark_message_sent(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: MessageStatus,
        provider: &str,
        provider_message_id: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Record a failed dispatch.
    async fn mark_message_failed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Reset a failed message to queued for a fresh transport attempt,
    /// incrementing `attempt_count`. Returns whether the reset happened.
    async fn requeue_message(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError>;

    /// Apply a provider delivery event (delivered/opened/clicked/failed) to a
    /// sent message, respecting the status state machine. Returns whether the
    /// transition was applied.
    async fn apply_delivery_event(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Number of messages of a campaign still in `queued` status.
    async fn count_queued_messages(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<u64, DatabaseError>;

    /// Per-status message counts for a campaign.
    async fn count_messages_by_status(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<HashMap<MessageStatus, u64>, DatabaseError>;

    /// Messages of a campaign, most recent first, up to `limit`.
    async fn list_messages_by_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>, DatabaseError>;

    // ── Suppression & history (batched, keyed by lead id) ───────────

    /// Record an active unsubscribe for a lead on a channel.
    async fn add_suppression(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
    ) -> Result<(), DatabaseError>;

    /// Record an inbound message from a lead on a channel.
    async fn add_inbound_message(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Leads among `lead_ids` with an active unsubscribe on `channel`.
    async fn active_unsubscribes(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
    ) -> Result<HashSet<Uuid>, DatabaseError>;

    /// Leads among `lead_ids` with an inbound message on `channel` since `since`.
    async fn leads_with_inbound_since(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, DatabaseError>;

    /// Outbound message counts on `channel` since `since`, keyed by lead id.
    /// Leads with zero sends are absent from the map.
    async fn outbound_counts_since(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<HashMap<Uuid, u32>, DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;

    /// Audit entries for one subject, most recent first.
    async fn list_audit_for_subject(
        &self,
        tenant_id: Uuid,
        subject: AuditSubject,
    ) -> Result<Vec<AuditEntry>, DatabaseError>;

    // ── Job queue ───────────────────────────────────────────────────

    /// Persist a new pending job.
    async fn enqueue_job(&self, job: &QueuedJob) -> Result<(), DatabaseError>;

    /// Claim up to `limit` due pending jobs (run_at <= now), marking them
    /// running. Ordered by run_at ascending.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, DatabaseError>;

    /// Mark a job done.
    async fn mark_job_done(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Record a job failure: increments attempts, resets to pending while
    /// attempts remain, otherwise parks the job as failed.
    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Re-queue jobs stuck in running state since before `older_than`.
    /// Returns the number of jobs re-queued.
    async fn requeue_stuck_jobs(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// Get one job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<QueuedJob>, DatabaseError>;
}
