//! Job runner: polls the persisted queue and executes due jobs.
//!
//! Each poll first re-queues jobs stuck in running state (crash recovery),
//! then claims due jobs and executes them concurrently up to
//! `max_parallel_jobs`. Execution is at-least-once; the operations behind
//! each job kind are idempotent, so a job that ran but died before its
//! done-mark is safe to replay.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{DispatchService, MessageGenerator};
use crate::store::Database;
use crate::worker::queue::{JobKind, QueuedJob};

/// Everything a runner needs to execute jobs.
pub struct RunnerDeps {
    pub db: Arc<dyn Database>,
    pub generator: Arc<MessageGenerator>,
    pub dispatch: Arc<DispatchService>,
}

/// Claims and executes queued jobs.
pub struct JobRunner {
    deps: RunnerDeps,
    config: EngineConfig,
    slots: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(deps: RunnerDeps, config: EngineConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_parallel_jobs.max(1)));
        Self {
            deps,
            config,
            slots,
        }
    }

    /// One poll cycle: reap stuck jobs, claim due jobs, execute them all.
    /// Returns the number of jobs executed.
    pub async fn run_once(self: &Arc<Self>) -> usize {
        self.reap_stuck_jobs().await;

        let jobs = match self
            .deps
            .db
            .claim_due_jobs(Utc::now(), self.config.claim_limit)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to claim due jobs");
                return 0;
            }
        };

        if jobs.is_empty() {
            return 0;
        }

        debug!(count = jobs.len(), "Claimed due jobs");
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                break;
            };
            let runner = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                runner.execute(job).await;
            }));
        }

        let executed = handles.len();
        futures::future::join_all(handles).await;
        executed
    }

    async fn execute(&self, job: QueuedJob) {
        debug!(job = %job.id, kind = job.kind.name(), "Executing job");

        let result = match job.kind.clone() {
            JobKind::Generate {
                campaign_id,
                step_id,
            } => self
                .deps
                .generator
                .generate(job.tenant_id, campaign_id, step_id)
                .await
                .map(|_| ()),
            JobKind::Dispatch { message_id } => {
                self.deps
                    .dispatch
                    .dispatch_message(job.tenant_id, message_id)
                    .await
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.deps.db.mark_job_done(job.id).await {
                    warn!(job = %job.id, error = %e, "Failed to mark job done");
                }
            }
            Err(e) => {
                error!(job = %job.id, kind = job.kind.name(), error = %e, "Job failed");
                if let Err(e) = self.deps.db.mark_job_failed(job.id, &e.to_string()).await {
                    warn!(job = %job.id, error = %e, "Failed to record job failure");
                }
            }
        }
    }

    /// Re-queue jobs claimed by a worker that never finished them.
    async fn reap_stuck_jobs(&self) {
        let Ok(threshold) = chrono::Duration::from_std(self.config.stuck_threshold) else {
            return;
        };
        match self
            .deps
            .db
            .requeue_stuck_jobs(Utc::now() - threshold)
            .await
        {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Re-queued stuck jobs"),
            Err(e) => warn!(error = %e, "Failed to re-queue stuck jobs"),
        }
    }
}

/// Spawn the runner's poll loop.
pub fn spawn_runner(runner: Arc<JobRunner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = runner.config.poll_interval.as_secs(),
            max_parallel = runner.config.max_parallel_jobs,
            "Job runner started"
        );

        // First tick fires immediately
        let mut tick = tokio::time::interval(runner.config.poll_interval);
        loop {
            tick.tick().await;
            runner.run_once().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::error::DispatchError;
    use crate::model::{
        Campaign, CampaignStatus, CampaignType, Channel, Lead, MessageStatus, OutboundMessage,
        PredicateOp, Segment, SegmentNode, Template,
    };
    use crate::providers::{DispatchResult, DispatcherRegistry, MessageDispatcher};
    use crate::render::VariableRenderer;
    use crate::store::LibSqlBackend;
    use crate::worker::JobStatus;

    struct AcceptAll;

    #[async_trait]
    impl MessageDispatcher for AcceptAll {
        fn name(&self) -> &str {
            "accept-all"
        }

        async fn dispatch(
            &self,
            _message: &OutboundMessage,
        ) -> Result<DispatchResult, DispatchError> {
            Ok(DispatchResult::accepted(None))
        }
    }

    async fn runner() -> (Arc<dyn Database>, Arc<JobRunner>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = DispatcherRegistry::new().with(Channel::Email, Arc::new(AcceptAll));
        let generator = Arc::new(MessageGenerator::new(
            db.clone(),
            Arc::new(VariableRenderer),
            50,
        ));
        let dispatch = Arc::new(DispatchService::new(db.clone(), registry, 3));
        let runner = Arc::new(JobRunner::new(
            RunnerDeps {
                db: db.clone(),
                generator,
                dispatch,
            },
            EngineConfig::default(),
        ));
        (db, runner)
    }

    #[tokio::test]
    async fn runs_generate_then_dispatch_jobs_to_completion() {
        let (db, runner) = runner().await;
        let tenant = Uuid::new_v4();

        let segment = Segment::new(
            tenant,
            "everyone",
            SegmentNode::predicate("status", PredicateOp::Exists, serde_json::json!(null)),
        );
        db.insert_segment(&segment).await.unwrap();
        let template = Template::new(tenant, "hello", Channel::Email, "Hi");
        db.insert_template(&template).await.unwrap();
        let campaign = Campaign::new(tenant, "wave", CampaignType::Broadcast, Channel::Email)
            .with_segment(segment.id)
            .with_template(template.id);
        db.insert_campaign(&campaign).await.unwrap();
        db.insert_lead(&Lead::new(tenant).with_email("a@example.com"))
            .await
            .unwrap();

        db.enqueue_job(&QueuedJob::immediate(
            tenant,
            JobKind::Generate {
                campaign_id: campaign.id,
                step_id: None,
            },
        ))
        .await
        .unwrap();

        // First cycle runs generation, which queues a dispatch job; the
        // second cycle dispatches.
        assert_eq!(runner.run_once().await, 1);
        assert_eq!(runner.run_once().await, 1);
        assert_eq!(runner.run_once().await, 0);

        let messages = db
            .list_messages_by_campaign(tenant, campaign.id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Sent);

        let fresh = db.get_campaign(tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn executed_jobs_are_marked_done() {
        let (db, runner) = runner().await;
        let tenant = Uuid::new_v4();

        // Generation for an unknown campaign is an audited no-op, so the
        // job itself still succeeds.
        let job = QueuedJob::immediate(
            tenant,
            JobKind::Generate {
                campaign_id: Uuid::new_v4(),
                step_id: None,
            },
        );
        db.enqueue_job(&job).await.unwrap();

        assert_eq!(runner.run_once().await, 1);

        let fresh = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn future_jobs_are_left_alone() {
        let (db, runner) = runner().await;
        let tenant = Uuid::new_v4();

        let job = QueuedJob::new(
            tenant,
            JobKind::Dispatch {
                message_id: Uuid::new_v4(),
            },
            Utc::now() + chrono::Duration::hours(1),
        );
        db.enqueue_job(&job).await.unwrap();

        assert_eq!(runner.run_once().await, 0);
        let fresh = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
    }
}
