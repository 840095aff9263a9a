//! Message generation: one pass turns a campaign (or drip step) into queued
//! outbound messages.
//!
//! A pass is idempotent: the dedup key (tenant, campaign, step-or-null, lead,
//! channel) is checked before rendering and enforced again by the store on
//! insert, so a crashed pass can be re-run from the start without duplicate
//! sends. Configuration gaps (missing template, missing segment) are audited
//! no-ops, never errors; the job queue treats them as success.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::engine::segments::{CompiledSegment, SegmentResolver};
use crate::engine::stop_rules::{LeadHistory, StopRuleEvaluator};
use crate::error::Result;
use crate::model::{
    AuditAction, AuditEntry, AuditSubject, Campaign, CampaignStatus, CampaignStep, Channel, Lead,
    OutboundMessage, StopRuleSettings, Template,
};
use crate::render::TemplateRenderer;
use crate::store::Database;
use crate::worker::{JobKind, QueuedJob};

/// Outcome counts of one generation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    /// Messages queued by this pass.
    pub created: u32,
    /// Candidates excluded: stop rules, missing destination, dedup, render
    /// failures.
    pub skipped: u32,
}

/// Runs generation passes.
pub struct MessageGenerator {
    db: Arc<dyn Database>,
    renderer: Arc<dyn TemplateRenderer>,
    batch_size: usize,
}

impl MessageGenerator {
    pub fn new(db: Arc<dyn Database>, renderer: Arc<dyn TemplateRenderer>, batch_size: usize) -> Self {
        Self {
            db,
            renderer,
            batch_size: batch_size.max(1),
        }
    }

    /// One generation pass for a campaign, optionally scoped to a drip step.
    pub async fn generate(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        step_id: Option<Uuid>,
    ) -> Result<GenerationSummary> {
        let Some(campaign) = self.db.get_campaign(tenant_id, campaign_id).await? else {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, "campaign_missing")
                .await;
        };

        if campaign.status.is_terminal_for_generation() {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, campaign.status.as_str())
                .await;
        }

        let step = match step_id {
            Some(id) => match self.db.get_step(tenant_id, id).await? {
                Some(step) if step.active => Some(step),
                Some(_) => {
                    return self
                        .skip_pass(tenant_id, campaign_id, step_id, "step_inactive")
                        .await;
                }
                None => {
                    return self
                        .skip_pass(tenant_id, campaign_id, step_id, "step_missing")
                        .await;
                }
            },
            None => None,
        };

        let template_id = step
            .as_ref()
            .and_then(|s| s.template_id)
            .or(campaign.template_id);
        let Some(template_id) = template_id else {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, "no_template")
                .await;
        };
        let Some(template) = self.db.get_template(tenant_id, template_id).await? else {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, "template_missing")
                .await;
        };

        let Some(segment_id) = campaign.segment_id else {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, "no_segment")
                .await;
        };
        let Some(segment) = self.db.get_segment(tenant_id, segment_id).await? else {
            return self
                .skip_pass(tenant_id, campaign_id, step_id, "segment_missing")
                .await;
        };

        let channel = step.as_ref().map_or(template.channel, |s| s.channel);
        let compiled = SegmentResolver::compile(&segment);

        let summary = self
            .walk_segment(&campaign, step.as_ref(), &template, channel, &compiled)
            .await?;

        // First completed pass moves the campaign into Running. Paused stays
        // paused; the CAS only fires from the pre-running states.
        self.db
            .set_campaign_status_if(
                tenant_id,
                campaign_id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignStatus::Running,
            )
            .await?;

        self.db
            .insert_audit(&AuditEntry::new(
                tenant_id,
                AuditSubject::Campaign(campaign_id),
                AuditAction::GenerationCompleted,
                json!({
                    "step_id": step_id,
                    "created": summary.created,
                    "skipped": summary.skipped,
                }),
            ))
            .await?;

        tracing::info!(
            campaign = %campaign_id,
            created = summary.created,
            skipped = summary.skipped,
            "Generation pass completed"
        );

        Ok(summary)
    }

    async fn walk_segment(
        &self,
        campaign: &Campaign,
        step: Option<&CampaignStep>,
        template: &Template,
        channel: Channel,
        compiled: &CompiledSegment,
    ) -> Result<GenerationSummary> {
        let mut summary = GenerationSummary::default();
        let mut cursor: Option<Uuid> = None;
        let campaign_began = campaign.launched_at.unwrap_or(campaign.created_at);

        loop {
            // Pause or completion observed at a batch boundary stops the walk;
            // the batch already in flight below runs to its end.
            if cursor.is_some() {
                match self.db.get_campaign(campaign.tenant_id, campaign.id).await? {
                    Some(fresh) if !fresh.status.is_terminal_for_generation() => {}
                    _ => {
                        tracing::info!(
                            campaign = %campaign.id,
                            "Campaign no longer generating; stopping pass early"
                        );
                        break;
                    }
                }
            }

            let (page, next) = SegmentResolver::resolve_page(
                self.db.as_ref(),
                campaign.tenant_id,
                compiled,
                cursor,
                self.batch_size,
            )
            .await?;

            if !page.is_empty() {
                let history = self
                    .load_history(campaign, channel, campaign_began, &page)
                    .await?;
                for lead in &page {
                    self.process_lead(campaign, step, template, channel, lead, &history, &mut summary)
                        .await?;
                }
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        Ok(summary)
    }

    /// Three batched lookups per page; rules that are disabled skip theirs.
    async fn load_history(
        &self,
        campaign: &Campaign,
        channel: Channel,
        campaign_began: DateTime<Utc>,
        page: &[Lead],
    ) -> Result<LeadHistory> {
        let settings = &campaign.stop_rules;
        let lead_ids: Vec<Uuid> = page.iter().map(|l| l.id).collect();
        let mut history = LeadHistory::default();

        if settings.opt_out {
            history.unsubscribed = self
                .db
                .active_unsubscribes(campaign.tenant_id, &lead_ids, channel)
                .await?;
        }
        if settings.replied {
            history.replied = self
                .db
                .leads_with_inbound_since(campaign.tenant_id, &lead_ids, channel, campaign_began)
                .await?;
        }
        if settings.fatigue {
            let since = fatigue_window_start(settings, campaign_began, Utc::now());
            history.outbound_counts = self
                .db
                .outbound_counts_since(campaign.tenant_id, &lead_ids, channel, since)
                .await?;
        }

        Ok(history)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_lead(
        &self,
        campaign: &Campaign,
        step: Option<&CampaignStep>,
        template: &Template,
        channel: Channel,
        lead: &Lead,
        history: &LeadHistory,
        summary: &mut GenerationSummary,
    ) -> Result<()> {
        let decision = StopRuleEvaluator::evaluate(&campaign.stop_rules, lead, channel, history);
        if let crate::engine::stop_rules::StopDecision::Stop(reason) = decision {
            tracing::debug!(lead = %lead.id, reason = reason.as_str(), "Lead stopped");
            summary.skipped += 1;
            return Ok(());
        }

        let Some(destination) = lead.destination(channel) else {
            tracing::debug!(lead = %lead.id, %channel, "Lead has no destination");
            summary.skipped += 1;
            return Ok(());
        };
        let destination = destination.to_string();

        let step_id = step.map(|s| s.id);
        if self
            .db
            .message_exists(campaign.tenant_id, campaign.id, step_id, lead.id, channel)
            .await?
        {
            summary.skipped += 1;
            return Ok(());
        }

        let rendered = match self.renderer.render(template, lead) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::warn!(lead = %lead.id, template = %template.id, error = %err, "Render failed; skipping lead");
                summary.skipped += 1;
                return Ok(());
            }
        };

        let message = OutboundMessage::queued(
            campaign.tenant_id,
            campaign.id,
            step_id,
            lead.id,
            channel,
            destination,
            rendered.subject,
            rendered.body,
        );

        // The unique index is the backstop for concurrent passes racing past
        // the existence check.
        if !self.db.insert_message(&message).await? {
            summary.skipped += 1;
            return Ok(());
        }

        self.db
            .enqueue_job(&QueuedJob::immediate(
                campaign.tenant_id,
                JobKind::Dispatch {
                    message_id: message.id,
                },
            ))
            .await?;

        summary.created += 1;
        Ok(())
    }

    async fn skip_pass(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        step_id: Option<Uuid>,
        reason: &str,
    ) -> Result<GenerationSummary> {
        tracing::info!(campaign = %campaign_id, reason, "Generation pass skipped");
        self.db
            .insert_audit(&AuditEntry::new(
                tenant_id,
                AuditSubject::Campaign(campaign_id),
                AuditAction::GenerationSkipped,
                json!({ "step_id": step_id, "reason": reason }),
            ))
            .await?;
        Ok(GenerationSummary::default())
    }
}

/// Start of the outbound-count window for the fatigue rule. A configured
/// rolling window wins; otherwise counting starts at campaign launch.
fn fatigue_window_start(
    settings: &StopRuleSettings,
    campaign_began: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match settings.fatigue_window_days {
        Some(days) => now - Duration::days(i64::from(days)),
        None => campaign_began,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CampaignType, MessageStatus, PredicateOp, Segment, SegmentNode};
    use crate::render::VariableRenderer;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    struct Fixture {
        db: Arc<dyn Database>,
        generator: MessageGenerator,
        tenant: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_with_batch(50).await
    }

    async fn fixture_with_batch(batch_size: usize) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let generator =
            MessageGenerator::new(db.clone(), Arc::new(VariableRenderer), batch_size);
        Fixture {
            db,
            generator,
            tenant: Uuid::new_v4(),
        }
    }

    /// Campaign + everyone-matching segment + template, ready to generate.
    async fn seed_campaign(f: &Fixture, stop_rules: StopRuleSettings) -> Campaign {
        let segment = Segment::new(
            f.tenant,
            "everyone",
            SegmentNode::predicate("status", PredicateOp::Exists, json!(null)),
        );
        f.db.insert_segment(&segment).await.unwrap();

        let template = Template::new(f.tenant, "hello", Channel::Email, "Hi {{ first_name }}")
            .with_subject("Hello");
        f.db.insert_template(&template).await.unwrap();

        let campaign = Campaign::new(f.tenant, "wave", CampaignType::Broadcast, Channel::Email)
            .with_segment(segment.id)
            .with_template(template.id)
            .with_stop_rules(stop_rules);
        f.db.insert_campaign(&campaign).await.unwrap();
        campaign
    }

    async fn seed_lead(f: &Fixture, email: Option<&str>) -> Lead {
        let mut lead = Lead::new(f.tenant);
        if let Some(email) = email {
            lead = lead.with_email(email);
        }
        f.db.insert_lead(&lead).await.unwrap();
        lead
    }

    #[tokio::test]
    async fn creates_messages_and_dispatch_jobs() {
        let f = fixture().await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        for i in 0..3 {
            seed_lead(&f, Some(&format!("l{i}@example.com"))).await;
        }

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary { created: 3, skipped: 0 });

        let messages = f
            .db
            .list_messages_by_campaign(f.tenant, campaign.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Queued));

        let jobs = f.db.claim_due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| matches!(j.kind, JobKind::Dispatch { .. })));

        let fresh = f.db.get_campaign(f.tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, CampaignStatus::Running);
    }

    #[tokio::test]
    async fn second_pass_creates_nothing() {
        let f = fixture().await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        seed_lead(&f, Some("a@example.com")).await;

        let first = f.generator.generate(f.tenant, campaign.id, None).await.unwrap();
        assert_eq!(first.created, 1);

        let second = f.generator.generate(f.tenant, campaign.id, None).await.unwrap();
        assert_eq!(second, GenerationSummary { created: 0, skipped: 1 });

        let messages = f
            .db
            .list_messages_by_campaign(f.tenant, campaign.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_and_destinationless_leads_are_skipped() {
        let f = fixture().await;
        let rules = StopRuleSettings {
            opt_out: true,
            ..Default::default()
        };
        let campaign = seed_campaign(&f, rules).await;

        for i in 0..3 {
            seed_lead(&f, Some(&format!("ok{i}@example.com"))).await;
        }
        let unsubscribed = seed_lead(&f, Some("bye@example.com")).await;
        f.db.add_suppression(f.tenant, unsubscribed.id, Channel::Email)
            .await
            .unwrap();
        seed_lead(&f, None).await;

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary { created: 3, skipped: 2 });
    }

    #[tokio::test]
    async fn missing_template_is_audited_noop() {
        let f = fixture().await;
        let segment = Segment::new(
            f.tenant,
            "everyone",
            SegmentNode::predicate("status", PredicateOp::Exists, json!(null)),
        );
        f.db.insert_segment(&segment).await.unwrap();
        let campaign = Campaign::new(f.tenant, "wave", CampaignType::Broadcast, Channel::Email)
            .with_segment(segment.id);
        f.db.insert_campaign(&campaign).await.unwrap();
        seed_lead(&f, Some("a@example.com")).await;

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary::default());

        // Status untouched, skip audited.
        let fresh = f.db.get_campaign(f.tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, CampaignStatus::Draft);
        let audits = f
            .db
            .list_audit_for_subject(f.tenant, AuditSubject::Campaign(campaign.id))
            .await
            .unwrap();
        assert!(audits.iter().any(|a| a.action == AuditAction::GenerationSkipped));
    }

    #[tokio::test]
    async fn paused_campaign_generates_nothing() {
        let f = fixture().await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        seed_lead(&f, Some("a@example.com")).await;
        f.db.set_campaign_status(f.tenant, campaign.id, CampaignStatus::Paused)
            .await
            .unwrap();

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary::default());
        assert!(
            f.db.list_messages_by_campaign(f.tenant, campaign.id, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn fatigue_sunset_skips_saturated_leads() {
        let f = fixture().await;
        let rules = StopRuleSettings {
            fatigue: true,
            fatigue_threshold: 1,
            reengagement_allowance: 0,
            ..Default::default()
        };
        let campaign = seed_campaign(&f, rules).await;
        let fresh_lead = seed_lead(&f, Some("fresh@example.com")).await;
        let tired_lead = seed_lead(&f, Some("tired@example.com")).await;

        // Prior sent message from an earlier campaign on the same channel.
        let mut prior = OutboundMessage::queued(
            f.tenant,
            Uuid::new_v4(),
            None,
            tired_lead.id,
            Channel::Email,
            "tired@example.com",
            None,
            "earlier wave",
        );
        prior.status = MessageStatus::Sent;
        assert!(f.db.insert_message(&prior).await.unwrap());

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary { created: 1, skipped: 1 });

        let messages = f
            .db
            .list_messages_by_campaign(f.tenant, campaign.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].lead_id, fresh_lead.id);
    }

    #[tokio::test]
    async fn replied_leads_are_skipped() {
        let f = fixture().await;
        let rules = StopRuleSettings {
            replied: true,
            ..Default::default()
        };
        let campaign = seed_campaign(&f, rules).await;
        seed_lead(&f, Some("quiet@example.com")).await;
        let replier = seed_lead(&f, Some("chatty@example.com")).await;
        f.db.add_inbound_message(f.tenant, replier.id, Channel::Email, Utc::now())
            .await
            .unwrap();

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary { created: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn drip_step_uses_step_channel_and_template() {
        let f = fixture().await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        let sms_template = Template::new(f.tenant, "nudge", Channel::Sms, "Still there?");
        f.db.insert_template(&sms_template).await.unwrap();
        let step = CampaignStep::new(&campaign, 1, Channel::Sms, 1440)
            .with_template(sms_template.id);
        f.db.insert_step(&step).await.unwrap();

        let lead = Lead::new(f.tenant)
            .with_email("a@example.com")
            .with_phone("+15550001111");
        f.db.insert_lead(&lead).await.unwrap();

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, Some(step.id))
            .await
            .unwrap();
        assert_eq!(summary.created, 1);

        let messages = f
            .db
            .list_messages_by_campaign(f.tenant, campaign.id, 10)
            .await
            .unwrap();
        assert_eq!(messages[0].channel, Channel::Sms);
        assert_eq!(messages[0].destination, "+15550001111");
        assert_eq!(messages[0].body, "Still there?");
        assert_eq!(messages[0].step_id, Some(step.id));
    }

    #[tokio::test]
    async fn render_failure_skips_lead_without_aborting_pass() {
        struct FailFor(Uuid);
        impl TemplateRenderer for FailFor {
            fn render(
                &self,
                template: &Template,
                lead: &Lead,
            ) -> std::result::Result<crate::model::RenderedContent, crate::error::RenderError>
            {
                if lead.id == self.0 {
                    Err(crate::error::RenderError::Failed("boom".into()))
                } else {
                    VariableRenderer.render(template, lead)
                }
            }
        }

        let f = fixture().await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        seed_lead(&f, Some("ok@example.com")).await;
        let poisoned = seed_lead(&f, Some("bad@example.com")).await;

        let generator =
            MessageGenerator::new(f.db.clone(), Arc::new(FailFor(poisoned.id)), 50);
        let summary = generator.generate(f.tenant, campaign.id, None).await.unwrap();
        assert_eq!(summary, GenerationSummary { created: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn multi_page_walk_covers_all_leads() {
        let f = fixture_with_batch(2).await;
        let campaign = seed_campaign(&f, StopRuleSettings::default()).await;
        for i in 0..7 {
            seed_lead(&f, Some(&format!("l{i}@example.com"))).await;
        }

        let summary = f
            .generator
            .generate(f.tenant, campaign.id, None)
            .await
            .unwrap();
        assert_eq!(summary, GenerationSummary { created: 7, skipped: 0 });
    }
}
