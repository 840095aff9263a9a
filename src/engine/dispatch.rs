//! Message dispatch: hands one queued message to its channel provider and
//! reconciles the outcome onto the message row.
//!
//! Dispatch is idempotent through the status guard: only `Queued` messages go
//! out, so a dispatch job replayed after a crash finds the message already
//! `Sent` and does nothing. Every outcome ends with a completion check; the
//! campaign flips to `Completed` exactly once because the flip is a
//! compare-and-set.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{
    AuditAction, AuditEntry, AuditSubject, CampaignStatus, MessageStatus, OutboundMessage,
};
use crate::providers::{DispatchResult, DispatcherRegistry};
use crate::store::Database;
use crate::worker::{JobKind, QueuedJob};

/// Dispatches queued messages and reconciles provider outcomes.
pub struct DispatchService {
    db: Arc<dyn Database>,
    registry: DispatcherRegistry,
    max_attempts: u32,
}

impl DispatchService {
    pub fn new(db: Arc<dyn Database>, registry: DispatcherRegistry, max_attempts: u32) -> Self {
        Self {
            db,
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Dispatch one message. Always `Ok` for per-message outcomes (sent,
    /// rejected, transport failure); `Err` is reserved for store failures.
    pub async fn dispatch_message(&self, tenant_id: Uuid, message_id: Uuid) -> Result<()> {
        let Some(message) = self.db.get_message(tenant_id, message_id).await? else {
            tracing::warn!(message = %message_id, "Dispatch for unknown message; ignoring");
            return Ok(());
        };

        // Status guard: anything past Queued was already handled.
        if message.status != MessageStatus::Queued {
            tracing::debug!(
                message = %message_id,
                status = message.status.as_str(),
                "Message not queued; dispatch is a no-op"
            );
            return Ok(());
        }

        if message.destination.trim().is_empty() {
            self.fail_terminal(
                &message,
                &format!("no destination for channel {}", message.channel),
            )
            .await?;
            return self.check_campaign_completion(&message).await;
        }

        let Some(dispatcher) = self.registry.get(message.channel) else {
            let err = DispatchError::NoDispatcher {
                channel: message.channel.to_string(),
            };
            self.fail_terminal(&message, &err.to_string()).await?;
            return self.check_campaign_completion(&message).await;
        };

        match dispatcher.dispatch(&message).await {
            Ok(DispatchResult {
                accepted: true,
                status,
                provider_message_id,
                ..
            }) => {
                self.db
                    .mark_message_sent(
                        tenant_id,
                        message_id,
                        status,
                        dispatcher.name(),
                        provider_message_id.as_deref(),
                    )
                    .await?;
                tracing::info!(
                    message = %message_id,
                    provider = dispatcher.name(),
                    "Message dispatched"
                );
            }
            Ok(DispatchResult { error, .. }) => {
                let reason = error.unwrap_or_else(|| "provider rejected message".into());
                self.fail_terminal(&message, &reason).await?;
            }
            Err(err) => {
                self.fail_transport(&message, &err).await?;
            }
        }

        self.check_campaign_completion(&message).await
    }

    /// Webhook-layer entry point: apply a provider delivery event to a sent
    /// message. Returns whether the state machine accepted the transition.
    pub async fn apply_delivery_event(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let applied = self
            .db
            .apply_delivery_event(tenant_id, message_id, status, at)
            .await?;
        if !applied {
            tracing::debug!(
                message = %message_id,
                status = status.as_str(),
                "Delivery event ignored by state machine"
            );
        }
        Ok(applied)
    }

    /// Permanent failure: no retry, no dispatcher re-invocation.
    async fn fail_terminal(&self, message: &OutboundMessage, reason: &str) -> Result<()> {
        tracing::warn!(message = %message.id, reason, "Message failed");
        self.db
            .mark_message_failed(message.tenant_id, message.id, reason)
            .await?;
        self.audit_failure(message, reason, false).await
    }

    /// Transport failure: the message goes back to queued with a backoff while
    /// attempts remain, then stays failed.
    async fn fail_transport(&self, message: &OutboundMessage, err: &DispatchError) -> Result<()> {
        let reason = err.to_string();
        self.db
            .mark_message_failed(message.tenant_id, message.id, &reason)
            .await?;

        let attempts_made = message.attempt_count + 1;
        let retry = attempts_made < self.max_attempts;
        if retry && self.db.requeue_message(message.tenant_id, message.id).await? {
            let run_at = Utc::now() + Duration::seconds(60 * i64::from(attempts_made));
            self.db
                .enqueue_job(&QueuedJob::new(
                    message.tenant_id,
                    JobKind::Dispatch {
                        message_id: message.id,
                    },
                    run_at,
                ))
                .await?;
            tracing::warn!(
                message = %message.id,
                attempt = attempts_made,
                error = %reason,
                "Transport error; message re-queued"
            );
        } else {
            tracing::error!(
                message = %message.id,
                attempt = attempts_made,
                error = %reason,
                "Transport error; attempts exhausted"
            );
        }

        self.audit_failure(message, &reason, retry).await
    }

    async fn audit_failure(
        &self,
        message: &OutboundMessage,
        reason: &str,
        requeued: bool,
    ) -> Result<()> {
        self.db
            .insert_audit(&AuditEntry::new(
                message.tenant_id,
                AuditSubject::Message(message.id),
                AuditAction::DispatchFailed,
                json!({
                    "campaign_id": message.campaign_id,
                    "error": reason,
                    "requeued": requeued,
                }),
            ))
            .await?;
        Ok(())
    }

    /// Flip the campaign to Completed once no queued message remains. The CAS
    /// makes concurrent final dispatches race safely: exactly one wins and
    /// writes the audit entry.
    async fn check_campaign_completion(&self, message: &OutboundMessage) -> Result<()> {
        let Some(campaign) = self
            .db
            .get_campaign(message.tenant_id, message.campaign_id)
            .await?
        else {
            return Ok(());
        };

        if !matches!(
            campaign.status,
            CampaignStatus::Running | CampaignStatus::Scheduled
        ) {
            return Ok(());
        }

        let queued = self
            .db
            .count_queued_messages(message.tenant_id, message.campaign_id)
            .await?;
        if queued > 0 {
            return Ok(());
        }

        let completed = self
            .db
            .set_campaign_status_if(
                message.tenant_id,
                message.campaign_id,
                &[CampaignStatus::Running, CampaignStatus::Scheduled],
                CampaignStatus::Completed,
            )
            .await?;

        if completed {
            let counts = self
                .db
                .count_messages_by_status(message.tenant_id, message.campaign_id)
                .await?;
            let sent = counts.get(&MessageStatus::Sent).copied().unwrap_or(0);
            let failed = counts.get(&MessageStatus::Failed).copied().unwrap_or(0);
            self.db
                .insert_audit(&AuditEntry::new(
                    message.tenant_id,
                    AuditSubject::Campaign(message.campaign_id),
                    AuditAction::CampaignCompleted,
                    json!({ "sent": sent, "failed": failed }),
                ))
                .await?;
            tracing::info!(campaign = %message.campaign_id, sent, failed, "Campaign completed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::{Campaign, CampaignType, Channel};
    use crate::providers::MessageDispatcher;
    use crate::store::LibSqlBackend;

    /// Scripted dispatcher: counts invocations and plays back one behavior.
    struct StubDispatcher {
        calls: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Accept,
        Reject,
        TransportError,
    }

    impl StubDispatcher {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                behavior,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageDispatcher for StubDispatcher {
        fn name(&self) -> &str {
            "stub"
        }

        async fn dispatch(
            &self,
            _message: &OutboundMessage,
        ) -> std::result::Result<DispatchResult, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Accept => Ok(DispatchResult::accepted(Some("prov-1".into()))),
                Behavior::Reject => Ok(DispatchResult::rejected("bad number")),
                Behavior::TransportError => Err(DispatchError::Transport {
                    provider: "stub".into(),
                    reason: "connection refused".into(),
                }),
            }
        }
    }

    struct Fixture {
        db: Arc<dyn Database>,
        tenant: Uuid,
        campaign: Campaign,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "wave", CampaignType::Broadcast, Channel::Email);
        db.insert_campaign(&campaign).await.unwrap();
        db.set_campaign_status(tenant, campaign.id, CampaignStatus::Running)
            .await
            .unwrap();
        Fixture {
            db,
            tenant,
            campaign,
        }
    }

    fn service(f: &Fixture, dispatcher: Arc<StubDispatcher>) -> DispatchService {
        let registry = DispatcherRegistry::new().with(Channel::Email, dispatcher);
        DispatchService::new(f.db.clone(), registry, 3)
    }

    async fn queued_message(f: &Fixture, destination: &str) -> OutboundMessage {
        let message = OutboundMessage::queued(
            f.tenant,
            f.campaign.id,
            None,
            Uuid::new_v4(),
            Channel::Email,
            destination,
            Some("Hi".into()),
            "body",
        );
        assert!(f.db.insert_message(&message).await.unwrap());
        message
    }

    #[tokio::test]
    async fn accepted_dispatch_marks_sent_and_completes_campaign() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Accept);
        let service = service(&f, stub.clone());
        let message = queued_message(&f, "a@example.com").await;

        service.dispatch_message(f.tenant, message.id).await.unwrap();

        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Sent);
        assert_eq!(fresh.provider.as_deref(), Some("stub"));
        assert_eq!(fresh.provider_message_id.as_deref(), Some("prov-1"));
        assert!(fresh.sent_at.is_some());
        assert_eq!(stub.calls(), 1);

        let campaign = f
            .db
            .get_campaign(f.tenant, f.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn non_queued_message_is_a_noop() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Accept);
        let service = service(&f, stub.clone());
        let message = queued_message(&f, "a@example.com").await;

        service.dispatch_message(f.tenant, message.id).await.unwrap();
        // Replay of the same job.
        service.dispatch_message(f.tenant, message.id).await.unwrap();

        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn blank_destination_fails_without_invoking_dispatcher() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Accept);
        let service = service(&f, stub.clone());
        let message = queued_message(&f, "").await;

        service.dispatch_message(f.tenant, message.id).await.unwrap();

        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Failed);
        assert!(fresh.error_message.unwrap().contains("no destination"));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn missing_dispatcher_fails_message() {
        let f = fixture().await;
        let service = DispatchService::new(f.db.clone(), DispatcherRegistry::new(), 3);
        let message = queued_message(&f, "a@example.com").await;

        service.dispatch_message(f.tenant, message.id).await.unwrap();

        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Failed);
        assert!(fresh.error_message.unwrap().contains("No dispatcher"));
    }

    #[tokio::test]
    async fn provider_rejection_is_terminal() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Reject);
        let service = service(&f, stub.clone());
        let message = queued_message(&f, "a@example.com").await;

        service.dispatch_message(f.tenant, message.id).await.unwrap();

        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Failed);
        assert_eq!(fresh.attempt_count, 0);

        // No retry job was queued: the campaign has completed.
        let campaign = f
            .db
            .get_campaign(f.tenant, f.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn transport_error_requeues_until_attempts_exhausted() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::TransportError);
        let service = service(&f, stub.clone());
        let message = queued_message(&f, "a@example.com").await;

        // Attempt 1 and 2: message returns to queued with a retry job.
        for expected_attempts in [1u32, 2] {
            service.dispatch_message(f.tenant, message.id).await.unwrap();
            let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
            assert_eq!(fresh.status, MessageStatus::Queued, "attempt {expected_attempts}");
            assert_eq!(fresh.attempt_count, expected_attempts);
        }

        // Attempt 3: exhausted, stays failed, campaign completes.
        service.dispatch_message(f.tenant, message.id).await.unwrap();
        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Failed);
        assert_eq!(stub.calls(), 3);

        let campaign = f
            .db
            .get_campaign(f.tenant, f.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn completion_fires_exactly_once_regardless_of_order() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Accept);
        let service = service(&f, stub.clone());

        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(queued_message(&f, &format!("l{i}@example.com")).await.id);
        }

        // Campaign stays running until the last message resolves.
        for id in &ids[..3] {
            service.dispatch_message(f.tenant, *id).await.unwrap();
            let campaign = f
                .db
                .get_campaign(f.tenant, f.campaign.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(campaign.status, CampaignStatus::Running);
        }
        service.dispatch_message(f.tenant, ids[3]).await.unwrap();

        let campaign = f
            .db
            .get_campaign(f.tenant, f.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);

        let audits = f
            .db
            .list_audit_for_subject(f.tenant, AuditSubject::Campaign(f.campaign.id))
            .await
            .unwrap();
        let completions = audits
            .iter()
            .filter(|a| a.action == AuditAction::CampaignCompleted)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn delivery_events_follow_state_machine() {
        let f = fixture().await;
        let stub = StubDispatcher::new(Behavior::Accept);
        let service = service(&f, stub);
        let message = queued_message(&f, "a@example.com").await;
        service.dispatch_message(f.tenant, message.id).await.unwrap();

        let now = Utc::now();
        assert!(
            service
                .apply_delivery_event(f.tenant, message.id, MessageStatus::Delivered, now)
                .await
                .unwrap()
        );
        assert!(
            service
                .apply_delivery_event(f.tenant, message.id, MessageStatus::Opened, now)
                .await
                .unwrap()
        );
        // Backwards transition is ignored.
        assert!(
            !service
                .apply_delivery_event(f.tenant, message.id, MessageStatus::Delivered, now)
                .await
                .unwrap()
        );

        let fresh = f.db.get_message(f.tenant, message.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, MessageStatus::Opened);
        assert!(fresh.delivered_at.is_some());
        assert!(fresh.opened_at.is_some());
    }
}
