//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. One connection is reused for
//! all operations; `libsql::Connection` is `Send + Sync` and safe for
//! concurrent async use.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    AuditAction, AuditEntry, AuditSubject, Campaign, CampaignStatus, CampaignStep, CampaignType,
    Channel, Lead, LeadStatus, MessageStatus, OutboundMessage, Segment, SegmentNode, Template,
};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::worker::queue::{JobKind, JobStatus, QueuedJob};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn qerr(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn serr(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Serialization(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(serr)
}

fn parse_optional_uuid(s: &Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_ref().map(|s| parse_uuid(s)).transpose()
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(u: Option<Uuid>) -> libsql::Value {
    match u {
        Some(u) => libsql::Value::Text(u.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

/// Build `?N, ?N+1, ...` placeholders for an IN clause.
fn in_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Row mappers ─────────────────────────────────────────────────────

const CAMPAIGN_COLUMNS: &str = "id, tenant_id, name, campaign_type, status, channel, segment_id, \
     template_id, start_at, end_at, launched_at, stop_rules, archived_at, created_at, updated_at";

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let type_str: String = row.get(3).map_err(qerr)?;
    let status_str: String = row.get(4).map_err(qerr)?;
    let channel_str: String = row.get(5).map_err(qerr)?;
    let segment_id: Option<String> = row.get(6).ok();
    let template_id: Option<String> = row.get(7).ok();
    let start_at: Option<String> = row.get(8).ok();
    let end_at: Option<String> = row.get(9).ok();
    let launched_at: Option<String> = row.get(10).ok();
    let stop_rules_str: String = row.get(11).map_err(qerr)?;
    let archived_at: Option<String> = row.get(12).ok();
    let created_str: String = row.get(13).map_err(qerr)?;
    let updated_str: String = row.get(14).map_err(qerr)?;

    Ok(Campaign {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        name: row.get(2).map_err(qerr)?,
        campaign_type: type_str.parse::<CampaignType>().map_err(serr)?,
        status: status_str.parse::<CampaignStatus>().map_err(serr)?,
        channel: channel_str.parse::<Channel>().map_err(serr)?,
        segment_id: parse_optional_uuid(&segment_id)?,
        template_id: parse_optional_uuid(&template_id)?,
        start_at: parse_optional_datetime(&start_at),
        end_at: parse_optional_datetime(&end_at),
        launched_at: parse_optional_datetime(&launched_at),
        stop_rules: serde_json::from_str(&stop_rules_str).map_err(serr)?,
        archived_at: parse_optional_datetime(&archived_at),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const STEP_COLUMNS: &str =
    "id, tenant_id, campaign_id, position, channel, delay_minutes, active, template_id, created_at";

fn row_to_step(row: &libsql::Row) -> Result<CampaignStep, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let campaign: String = row.get(2).map_err(qerr)?;
    let position: i64 = row.get(3).map_err(qerr)?;
    let channel_str: String = row.get(4).map_err(qerr)?;
    let delay: i64 = row.get(5).map_err(qerr)?;
    let active: i64 = row.get(6).map_err(qerr)?;
    let template_id: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8).map_err(qerr)?;

    Ok(CampaignStep {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        campaign_id: parse_uuid(&campaign)?,
        position: position as u32,
        channel: channel_str.parse::<Channel>().map_err(serr)?,
        delay_minutes: delay as u32,
        active: active != 0,
        template_id: parse_optional_uuid(&template_id)?,
        created_at: parse_datetime(&created_str),
    })
}

const SEGMENT_COLUMNS: &str = "id, tenant_id, name, rules, created_at, updated_at";

fn row_to_segment(row: &libsql::Row) -> Result<Segment, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let rules_str: String = row.get(3).map_err(qerr)?;
    let created_str: String = row.get(4).map_err(qerr)?;
    let updated_str: String = row.get(5).map_err(qerr)?;

    Ok(Segment {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        name: row.get(2).map_err(qerr)?,
        rules: serde_json::from_str::<SegmentNode>(&rules_str).map_err(serr)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const LEAD_COLUMNS: &str = "id, tenant_id, email, phone, status, attributes, created_at, updated_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let status_str: String = row.get(4).map_err(qerr)?;
    let attributes_str: String = row.get(5).map_err(qerr)?;
    let created_str: String = row.get(6).map_err(qerr)?;
    let updated_str: String = row.get(7).map_err(qerr)?;

    Ok(Lead {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        email: row.get(2).ok(),
        phone: row.get(3).ok(),
        status: status_str.parse::<LeadStatus>().map_err(serr)?,
        attributes: serde_json::from_str(&attributes_str).map_err(serr)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TEMPLATE_COLUMNS: &str = "id, tenant_id, name, channel, subject, body, created_at";

fn row_to_template(row: &libsql::Row) -> Result<Template, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let channel_str: String = row.get(3).map_err(qerr)?;
    let created_str: String = row.get(6).map_err(qerr)?;

    Ok(Template {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        name: row.get(2).map_err(qerr)?,
        channel: channel_str.parse::<Channel>().map_err(serr)?,
        subject: row.get(4).ok(),
        body: row.get(5).map_err(qerr)?,
        created_at: parse_datetime(&created_str),
    })
}

const MESSAGE_COLUMNS: &str = "id, tenant_id, campaign_id, step_id, lead_id, channel, status, \
     destination, subject, body, provider, provider_message_id, error_message, attempt_count, \
     sent_at, delivered_at, opened_at, clicked_at, failed_at, created_at, updated_at";

fn row_to_outbound(row: &libsql::Row) -> Result<OutboundMessage, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let campaign: String = row.get(2).map_err(qerr)?;
    let step_id: Option<String> = row.get(3).ok();
    let lead: String = row.get(4).map_err(qerr)?;
    let channel_str: String = row.get(5).map_err(qerr)?;
    let status_str: String = row.get(6).map_err(qerr)?;
    let attempt_count: i64 = row.get(13).map_err(qerr)?;
    let sent_at: Option<String> = row.get(14).ok();
    let delivered_at: Option<String> = row.get(15).ok();
    let opened_at: Option<String> = row.get(16).ok();
    let clicked_at: Option<String> = row.get(17).ok();
    let failed_at: Option<String> = row.get(18).ok();
    let created_str: String = row.get(19).map_err(qerr)?;
    let updated_str: String = row.get(20).map_err(qerr)?;

    Ok(OutboundMessage {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        campaign_id: parse_uuid(&campaign)?,
        step_id: parse_optional_uuid(&step_id)?,
        lead_id: parse_uuid(&lead)?,
        channel: channel_str.parse::<Channel>().map_err(serr)?,
        status: status_str.parse::<MessageStatus>().map_err(serr)?,
        destination: row.get(7).map_err(qerr)?,
        subject: row.get(8).ok(),
        body: row.get(9).map_err(qerr)?,
        provider: row.get(10).ok(),
        provider_message_id: row.get(11).ok(),
        error_message: row.get(12).ok(),
        attempt_count: attempt_count as u32,
        sent_at: parse_optional_datetime(&sent_at),
        delivered_at: parse_optional_datetime(&delivered_at),
        opened_at: parse_optional_datetime(&opened_at),
        clicked_at: parse_optional_datetime(&clicked_at),
        failed_at: parse_optional_datetime(&failed_at),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const AUDIT_COLUMNS: &str = "id, tenant_id, subject_type, subject_id, action, detail, created_at";

fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let subject_type: String = row.get(2).map_err(qerr)?;
    let subject_id: String = row.get(3).map_err(qerr)?;
    let action_str: String = row.get(4).map_err(qerr)?;
    let detail_str: String = row.get(5).map_err(qerr)?;
    let created_str: String = row.get(6).map_err(qerr)?;

    let subject_uuid = parse_uuid(&subject_id)?;
    let subject = match subject_type.as_str() {
        "campaign" => AuditSubject::Campaign(subject_uuid),
        "message" => AuditSubject::Message(subject_uuid),
        other => {
            return Err(DatabaseError::Serialization(format!(
                "unknown audit subject type: {other}"
            )));
        }
    };

    Ok(AuditEntry {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        subject,
        action: action_str.parse::<AuditAction>().map_err(serr)?,
        detail: serde_json::from_str(&detail_str).map_err(serr)?,
        created_at: parse_datetime(&created_str),
    })
}

const JOB_COLUMNS: &str = "id, tenant_id, kind, payload, run_at, status, attempts, max_attempts, \
     last_error, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<QueuedJob, DatabaseError> {
    let id: String = row.get(0).map_err(qerr)?;
    let tenant: String = row.get(1).map_err(qerr)?;
    let payload_str: String = row.get(3).map_err(qerr)?;
    let run_at_str: String = row.get(4).map_err(qerr)?;
    let status_str: String = row.get(5).map_err(qerr)?;
    let attempts: i64 = row.get(6).map_err(qerr)?;
    let max_attempts: i64 = row.get(7).map_err(qerr)?;
    let created_str: String = row.get(9).map_err(qerr)?;
    let updated_str: String = row.get(10).map_err(qerr)?;

    Ok(QueuedJob {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant)?,
        kind: serde_json::from_str::<JobKind>(&payload_str).map_err(serr)?,
        run_at: parse_datetime(&run_at_str),
        status: status_str.parse::<JobStatus>().map_err(serr)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        last_error: row.get(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run(self.conn()).await
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let stop_rules = serde_json::to_string(&campaign.stop_rules).map_err(serr)?;

        self.conn()
            .execute(
                "INSERT INTO campaigns (id, tenant_id, name, campaign_type, status, channel, \
                 segment_id, template_id, start_at, end_at, launched_at, stop_rules, archived_at, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    campaign.id.to_string(),
                    campaign.tenant_id.to_string(),
                    campaign.name.clone(),
                    campaign.campaign_type.as_str(),
                    campaign.status.as_str(),
                    campaign.channel.as_str(),
                    opt_uuid(campaign.segment_id),
                    opt_uuid(campaign.template_id),
                    opt_datetime(campaign.start_at),
                    opt_datetime(campaign.end_at),
                    opt_datetime(campaign.launched_at),
                    stop_rules,
                    opt_datetime(campaign.archived_at),
                    campaign.created_at.to_rfc3339(),
                    campaign.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn get_campaign(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_campaign(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_campaign_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 \
                 WHERE tenant_id = ?3 AND id = ?4",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                    id.to_string()
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn set_campaign_status_if(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool, DatabaseError> {
        if from.is_empty() {
            return Ok(false);
        }

        let placeholders = in_placeholders(5, from.len());
        let mut values: Vec<libsql::Value> = vec![
            libsql::Value::Text(to.as_str().to_string()),
            libsql::Value::Text(Utc::now().to_rfc3339()),
            libsql::Value::Text(tenant_id.to_string()),
            libsql::Value::Text(id.to_string()),
        ];
        values.extend(
            from.iter()
                .map(|s| libsql::Value::Text(s.as_str().to_string())),
        );

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE campaigns SET status = ?1, updated_at = ?2 \
                     WHERE tenant_id = ?3 AND id = ?4 AND status IN ({placeholders})"
                ),
                values,
            )
            .await
            .map_err(qerr)?;
        Ok(changed > 0)
    }

    async fn mark_campaign_launched(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET launched_at = ?1, updated_at = ?2 \
                 WHERE tenant_id = ?3 AND id = ?4 AND launched_at IS NULL",
                params![
                    at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                    id.to_string()
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(changed > 0)
    }

    async fn archive_campaign(&self, tenant_id: Uuid, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE campaigns SET archived_at = ?1, updated_at = ?1 \
                 WHERE tenant_id = ?2 AND id = ?3 AND archived_at IS NULL",
                params![Utc::now().to_rfc3339(), tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    // ── Campaign steps ──────────────────────────────────────────────

    async fn insert_step(&self, step: &CampaignStep) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaign_steps (id, tenant_id, campaign_id, position, channel, \
                 delay_minutes, active, template_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    step.id.to_string(),
                    step.tenant_id.to_string(),
                    step.campaign_id.to_string(),
                    step.position as i64,
                    step.channel.as_str(),
                    step.delay_minutes as i64,
                    step.active as i64,
                    opt_uuid(step.template_id),
                    step.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn list_active_steps(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM campaign_steps \
                     WHERE tenant_id = ?1 AND campaign_id = ?2 AND active = 1 \
                     ORDER BY position ASC"
                ),
                params![tenant_id.to_string(), campaign_id.to_string()],
            )
            .await
            .map_err(qerr)?;

        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    async fn get_step(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<CampaignStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM campaign_steps WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    // ── Segments ────────────────────────────────────────────────────

    async fn insert_segment(&self, segment: &Segment) -> Result<(), DatabaseError> {
        let rules = serde_json::to_string(&segment.rules).map_err(serr)?;

        self.conn()
            .execute(
                "INSERT INTO segments (id, tenant_id, name, rules, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    segment.id.to_string(),
                    segment.tenant_id.to_string(),
                    segment.name.clone(),
                    rules,
                    segment.created_at.to_rfc3339(),
                    segment.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn get_segment(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Segment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_segment(&row)?)),
            None => Ok(None),
        }
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let attributes =
            serde_json::to_string(&serde_json::Value::Object(lead.attributes.clone()))
                .map_err(serr)?;

        self.conn()
            .execute(
                "INSERT INTO leads (id, tenant_id, email, phone, status, attributes, created_at, \
                 updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    lead.id.to_string(),
                    lead.tenant_id.to_string(),
                    opt_text(lead.email.as_deref()),
                    opt_text(lead.phone.as_deref()),
                    lead.status.as_str(),
                    attributes,
                    lead.created_at.to_rfc3339(),
                    lead.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn list_leads_page(
        &self,
        tenant_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = match after {
            Some(after) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads \
                         WHERE tenant_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3"
                    ),
                    params![tenant_id.to_string(), after.to_string(), limit as i64],
                )
                .await
                .map_err(qerr)?,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads \
                         WHERE tenant_id = ?1 ORDER BY id ASC LIMIT ?2"
                    ),
                    params![tenant_id.to_string(), limit as i64],
                )
                .await
                .map_err(qerr)?,
        };

        let mut leads = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &Template) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO templates (id, tenant_id, name, channel, subject, body, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    template.id.to_string(),
                    template.tenant_id.to_string(),
                    template.name.clone(),
                    template.channel.as_str(),
                    opt_text(template.subject.as_deref()),
                    template.body.clone(),
                    template.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn get_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Template>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_template(&row)?)),
            None => Ok(None),
        }
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &OutboundMessage) -> Result<bool, DatabaseError> {
        let result = self
            .conn()
            .execute(
                "INSERT INTO messages (id, tenant_id, campaign_id, step_id, lead_id, channel, \
                 direction, status, destination, subject, body, provider, provider_message_id, \
                 error_message, attempt_count, sent_at, delivered_at, opened_at, clicked_at, \
                 failed_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'outbound', ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                 ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    message.id.to_string(),
                    message.tenant_id.to_string(),
                    message.campaign_id.to_string(),
                    opt_uuid(message.step_id),
                    message.lead_id.to_string(),
                    message.channel.as_str(),
                    message.status.as_str(),
                    message.destination.clone(),
                    opt_text(message.subject.as_deref()),
                    message.body.clone(),
                    opt_text(message.provider.as_deref()),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.error_message.as_deref()),
                    message.attempt_count as i64,
                    opt_datetime(message.sent_at),
                    opt_datetime(message.delivered_at),
                    opt_datetime(message.opened_at),
                    opt_datetime(message.clicked_at),
                    opt_datetime(message.failed_at),
                    message.created_at.to_rfc3339(),
                    message.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            // The dedup index is the write-time correctness guard; a concurrent
            // pass losing this race counts the recipient as already generated.
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => Ok(false),
            Err(e) => Err(qerr(e)),
        }
    }

    async fn get_message(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_outbound(&row)?)),
            None => Ok(None),
        }
    }

    async fn message_exists(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        step_id: Option<Uuid>,
        lead_id: Uuid,
        channel: Channel,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM messages \
                 WHERE tenant_id = ?1 AND campaign_id = ?2 AND COALESCE(step_id, '') = ?3 \
                 AND lead_id = ?4 AND channel = ?5 AND direction = 'outbound' LIMIT 1",
                params![
                    tenant_id.to_string(),
                    campaign_id.to_string(),
                    step_id.map(|s| s.to_string()).unwrap_or_default(),
                    lead_id.to_string(),
                    channel.as_str(),
                ],
            )
            .await
            .map_err(qerr)?;

        Ok(rows.next().await.map_err(qerr)?.is_some())
    }

    async fn mark_message_sent(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: MessageStatus,
        provider: &str,
        provider_message_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = ?1, provider = ?2, provider_message_id = ?3, \
                 sent_at = ?4, updated_at = ?4 WHERE tenant_id = ?5 AND id = ?6",
                params![
                    status.as_str(),
                    provider,
                    opt_text(provider_message_id),
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn mark_message_failed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'failed', error_message = ?1, failed_at = ?2, \
                 updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
                params![
                    error,
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                    id.to_string()
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn requeue_message(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'queued', attempt_count = attempt_count + 1, \
                 failed_at = NULL, updated_at = ?1 \
                 WHERE tenant_id = ?2 AND id = ?3 AND status = 'failed'",
                params![Utc::now().to_rfc3339(), tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(qerr)?;
        Ok(changed > 0)
    }

    async fn apply_delivery_event(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let Some(current) = self.get_message(tenant_id, id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "message".to_string(),
                id: id.to_string(),
            });
        };

        if !current.status.can_transition_to(status) {
            return Ok(false);
        }

        let timestamp_column = match status {
            MessageStatus::Delivered => "delivered_at",
            MessageStatus::Opened => "opened_at",
            MessageStatus::Clicked => "clicked_at",
            MessageStatus::Failed => "failed_at",
            _ => return Ok(false),
        };

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE messages SET status = ?1, {timestamp_column} = ?2, updated_at = ?3 \
                     WHERE tenant_id = ?4 AND id = ?5 AND status = ?6"
                ),
                params![
                    status.as_str(),
                    at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                    id.to_string(),
                    current.status.as_str(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(changed > 0)
    }

    async fn count_queued_messages(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages \
                 WHERE tenant_id = ?1 AND campaign_id = ?2 AND status = 'queued'",
                params![tenant_id.to_string(), campaign_id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(qerr)? as u64),
            None => Ok(0),
        }
    }

    async fn count_messages_by_status(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<HashMap<MessageStatus, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM messages \
                 WHERE tenant_id = ?1 AND campaign_id = ?2 GROUP BY status",
                params![tenant_id.to_string(), campaign_id.to_string()],
            )
            .await
            .map_err(qerr)?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            let status_str: String = row.get(0).map_err(qerr)?;
            let count: i64 = row.get(1).map_err(qerr)?;
            let status = status_str.parse::<MessageStatus>().map_err(serr)?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn list_messages_by_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE tenant_id = ?1 AND campaign_id = ?2 \
                     ORDER BY created_at DESC LIMIT ?3"
                ),
                params![
                    tenant_id.to_string(),
                    campaign_id.to_string(),
                    limit as i64
                ],
            )
            .await
            .map_err(qerr)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            messages.push(row_to_outbound(&row)?);
        }
        Ok(messages)
    }

    // ── Suppression & history ───────────────────────────────────────

    async fn add_suppression(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO suppressions (id, tenant_id, lead_id, channel, active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id.to_string(),
                    lead_id.to_string(),
                    channel.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn add_inbound_message(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inbound_messages (id, tenant_id, lead_id, channel, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id.to_string(),
                    lead_id.to_string(),
                    channel.as_str(),
                    received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn active_unsubscribes(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
    ) -> Result<HashSet<Uuid>, DatabaseError> {
        if lead_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = in_placeholders(3, lead_ids.len());
        let mut values: Vec<libsql::Value> = vec![
            libsql::Value::Text(tenant_id.to_string()),
            libsql::Value::Text(channel.as_str().to_string()),
        ];
        values.extend(
            lead_ids
                .iter()
                .map(|id| libsql::Value::Text(id.to_string())),
        );

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT DISTINCT lead_id FROM suppressions \
                     WHERE tenant_id = ?1 AND channel = ?2 AND active = 1 \
                     AND lead_id IN ({placeholders})"
                ),
                values,
            )
            .await
            .map_err(qerr)?;

        let mut out = HashSet::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            let id: String = row.get(0).map_err(qerr)?;
            out.insert(parse_uuid(&id)?);
        }
        Ok(out)
    }

    async fn leads_with_inbound_since(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, DatabaseError> {
        if lead_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = in_placeholders(4, lead_ids.len());
        let mut values: Vec<libsql::Value> = vec![
            libsql::Value::Text(tenant_id.to_string()),
            libsql::Value::Text(channel.as_str().to_string()),
            libsql::Value::Text(since.to_rfc3339()),
        ];
        values.extend(
            lead_ids
                .iter()
                .map(|id| libsql::Value::Text(id.to_string())),
        );

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT DISTINCT lead_id FROM inbound_messages \
                     WHERE tenant_id = ?1 AND channel = ?2 AND received_at >= ?3 \
                     AND lead_id IN ({placeholders})"
                ),
                values,
            )
            .await
            .map_err(qerr)?;

        let mut out = HashSet::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            let id: String = row.get(0).map_err(qerr)?;
            out.insert(parse_uuid(&id)?);
        }
        Ok(out)
    }

    async fn outbound_counts_since(
        &self,
        tenant_id: Uuid,
        lead_ids: &[Uuid],
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<HashMap<Uuid, u32>, DatabaseError> {
        if lead_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = in_placeholders(4, lead_ids.len());
        let mut values: Vec<libsql::Value> = vec![
            libsql::Value::Text(tenant_id.to_string()),
            libsql::Value::Text(channel.as_str().to_string()),
            libsql::Value::Text(since.to_rfc3339()),
        ];
        values.extend(
            lead_ids
                .iter()
                .map(|id| libsql::Value::Text(id.to_string())),
        );

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT lead_id, COUNT(*) FROM messages \
                     WHERE tenant_id = ?1 AND channel = ?2 AND direction = 'outbound' \
                     AND status != 'queued' AND created_at >= ?3 \
                     AND lead_id IN ({placeholders}) GROUP BY lead_id"
                ),
                values,
            )
            .await
            .map_err(qerr)?;

        let mut out = HashMap::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            let id: String = row.get(0).map_err(qerr)?;
            let count: i64 = row.get(1).map_err(qerr)?;
            out.insert(parse_uuid(&id)?, count as u32);
        }
        Ok(out)
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), DatabaseError> {
        let detail = serde_json::to_string(&entry.detail).map_err(serr)?;

        self.conn()
            .execute(
                "INSERT INTO audit_log (id, tenant_id, subject_type, subject_id, action, detail, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.tenant_id.to_string(),
                    entry.subject.type_str(),
                    entry.subject.id().to_string(),
                    entry.action.as_str(),
                    detail,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn list_audit_for_subject(
        &self,
        tenant_id: Uuid,
        subject: AuditSubject,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log \
                     WHERE tenant_id = ?1 AND subject_type = ?2 AND subject_id = ?3 \
                     ORDER BY created_at DESC"
                ),
                params![
                    tenant_id.to_string(),
                    subject.type_str(),
                    subject.id().to_string()
                ],
            )
            .await
            .map_err(qerr)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            entries.push(row_to_audit(&row)?);
        }
        Ok(entries)
    }

    // ── Job queue ───────────────────────────────────────────────────

    async fn enqueue_job(&self, job: &QueuedJob) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&job.kind).map_err(serr)?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, tenant_id, kind, payload, run_at, status, attempts, \
                 max_attempts, last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.tenant_id.to_string(),
                    job.kind.name(),
                    payload,
                    job.run_at.to_rfc3339(),
                    job.status.as_str(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    opt_text(job.last_error.as_deref()),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status = 'pending' AND run_at <= ?1 \
                     ORDER BY run_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(qerr)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(qerr)? {
            candidates.push(row_to_job(&row)?);
        }

        // The conditional update is the claim; a job stolen by another worker
        // between the select and the update is simply skipped here.
        let mut claimed = Vec::new();
        for mut job in candidates {
            let changed = self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'running', updated_at = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![Utc::now().to_rfc3339(), job.id.to_string()],
                )
                .await
                .map_err(qerr)?;

            if changed > 0 {
                job.status = JobStatus::Running;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn mark_job_done(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'done', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        // Retry while attempts remain, otherwise park the job as failed.
        self.conn()
            .execute(
                "UPDATE jobs SET attempts = attempts + 1, last_error = ?1, updated_at = ?2, \
                 status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END \
                 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(qerr)?;
        Ok(())
    }

    async fn requeue_stuck_jobs(&self, older_than: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', updated_at = ?1 \
                 WHERE status = 'running' AND updated_at < ?2",
                params![Utc::now().to_rfc3339(), older_than.to_rfc3339()],
            )
            .await
            .map_err(qerr)?;
        Ok(changed as usize)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueuedJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(qerr)?;

        match rows.next().await.map_err(qerr)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CampaignType;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn campaign_roundtrip() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "Spring promo", CampaignType::Broadcast, Channel::Email)
            .with_segment(Uuid::new_v4());

        db.insert_campaign(&campaign).await.unwrap();
        let loaded = db.get_campaign(tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Spring promo");
        assert_eq!(loaded.campaign_type, CampaignType::Broadcast);
        assert_eq!(loaded.status, CampaignStatus::Draft);
        assert_eq!(loaded.segment_id, campaign.segment_id);
        assert!(loaded.launched_at.is_none());
    }

    #[tokio::test]
    async fn campaign_is_tenant_scoped() {
        let db = backend().await;
        let campaign = Campaign::new(
            Uuid::new_v4(),
            "Private",
            CampaignType::Broadcast,
            Channel::Email,
        );
        db.insert_campaign(&campaign).await.unwrap();

        let other_tenant = Uuid::new_v4();
        assert!(
            db.get_campaign(other_tenant, campaign.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn status_cas_only_fires_from_listed_states() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "c", CampaignType::Broadcast, Channel::Email);
        db.insert_campaign(&campaign).await.unwrap();

        let moved = db
            .set_campaign_status_if(
                tenant,
                campaign.id,
                &[CampaignStatus::Running],
                CampaignStatus::Completed,
            )
            .await
            .unwrap();
        assert!(!moved, "draft campaign must not complete");

        db.set_campaign_status(tenant, campaign.id, CampaignStatus::Running)
            .await
            .unwrap();
        let moved = db
            .set_campaign_status_if(
                tenant,
                campaign.id,
                &[CampaignStatus::Running, CampaignStatus::Scheduled],
                CampaignStatus::Completed,
            )
            .await
            .unwrap();
        assert!(moved);

        // Second completion attempt is a no-op.
        let moved = db
            .set_campaign_status_if(
                tenant,
                campaign.id,
                &[CampaignStatus::Running, CampaignStatus::Scheduled],
                CampaignStatus::Completed,
            )
            .await
            .unwrap();
        assert!(!moved);
    }

    #[tokio::test]
    async fn launched_guard_wins_once() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "c", CampaignType::Broadcast, Channel::Email);
        db.insert_campaign(&campaign).await.unwrap();

        assert!(
            db.mark_campaign_launched(tenant, campaign.id, Utc::now())
                .await
                .unwrap()
        );
        assert!(
            !db.mark_campaign_launched(tenant, campaign.id, Utc::now())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn archive_sets_timestamp_once() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "c", CampaignType::Broadcast, Channel::Email);
        db.insert_campaign(&campaign).await.unwrap();

        db.archive_campaign(tenant, campaign.id).await.unwrap();
        let loaded = db.get_campaign(tenant, campaign.id).await.unwrap().unwrap();
        let first = loaded.archived_at.expect("archived_at set");

        // Guard on archived_at keeps the original timestamp.
        db.archive_campaign(tenant, campaign.id).await.unwrap();
        let loaded = db.get_campaign(tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.archived_at, Some(first));
    }

    #[tokio::test]
    async fn message_dedup_insert_returns_false() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let campaign_id = Uuid::new_v4();
        let lead_id = Uuid::new_v4();

        let first = OutboundMessage::queued(
            tenant,
            campaign_id,
            None,
            lead_id,
            Channel::Email,
            "a@example.com",
            Some("Hi".into()),
            "body",
        );
        assert!(db.insert_message(&first).await.unwrap());

        let duplicate = OutboundMessage::queued(
            tenant,
            campaign_id,
            None,
            lead_id,
            Channel::Email,
            "a@example.com",
            Some("Hi".into()),
            "body",
        );
        assert!(!db.insert_message(&duplicate).await.unwrap());

        // A different step is a different key.
        let stepped = OutboundMessage::queued(
            tenant,
            campaign_id,
            Some(Uuid::new_v4()),
            lead_id,
            Channel::Email,
            "a@example.com",
            None,
            "body",
        );
        assert!(db.insert_message(&stepped).await.unwrap());
    }

    #[tokio::test]
    async fn batched_history_lookups() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let suppressed = Uuid::new_v4();
        let replied = Uuid::new_v4();
        let clean = Uuid::new_v4();
        let since = Utc::now() - chrono::Duration::hours(1);

        db.add_suppression(tenant, suppressed, Channel::Email)
            .await
            .unwrap();
        db.add_inbound_message(tenant, replied, Channel::Email, Utc::now())
            .await
            .unwrap();

        let ids = vec![suppressed, replied, clean];
        let unsubs = db
            .active_unsubscribes(tenant, &ids, Channel::Email)
            .await
            .unwrap();
        assert!(unsubs.contains(&suppressed));
        assert_eq!(unsubs.len(), 1);

        // Unsubscribe on email must not bleed into sms.
        let sms_unsubs = db
            .active_unsubscribes(tenant, &ids, Channel::Sms)
            .await
            .unwrap();
        assert!(sms_unsubs.is_empty());

        let inbound = db
            .leads_with_inbound_since(tenant, &ids, Channel::Email, since)
            .await
            .unwrap();
        assert!(inbound.contains(&replied));
        assert_eq!(inbound.len(), 1);
    }

    #[tokio::test]
    async fn outbound_counts_exclude_queued() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let lead = Uuid::new_v4();
        let since = Utc::now() - chrono::Duration::hours(1);

        let sent = OutboundMessage::queued(
            tenant,
            Uuid::new_v4(),
            None,
            lead,
            Channel::Email,
            "a@example.com",
            None,
            "b",
        );
        db.insert_message(&sent).await.unwrap();
        db.mark_message_sent(tenant, sent.id, MessageStatus::Sent, "smtp", None)
            .await
            .unwrap();

        let queued = OutboundMessage::queued(
            tenant,
            Uuid::new_v4(),
            None,
            lead,
            Channel::Email,
            "a@example.com",
            None,
            "b",
        );
        db.insert_message(&queued).await.unwrap();

        let counts = db
            .outbound_counts_since(tenant, &[lead], Channel::Email, since)
            .await
            .unwrap();
        assert_eq!(counts.get(&lead), Some(&1));
    }

    #[tokio::test]
    async fn job_claim_marks_running_and_skips_future() {
        let db = backend().await;
        let tenant = Uuid::new_v4();

        let due = QueuedJob::immediate(
            tenant,
            JobKind::Dispatch {
                message_id: Uuid::new_v4(),
            },
        );
        let future = QueuedJob::new(
            tenant,
            JobKind::Generate {
                campaign_id: Uuid::new_v4(),
                step_id: None,
            },
            Utc::now() + chrono::Duration::minutes(90),
        );
        db.enqueue_job(&due).await.unwrap();
        db.enqueue_job(&future).await.unwrap();

        let claimed = db.claim_due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].status, JobStatus::Running);

        // Already claimed; nothing more due.
        assert!(db.claim_due_jobs(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_failure_retries_until_attempts_exhausted() {
        let db = backend().await;
        let job = QueuedJob::immediate(
            Uuid::new_v4(),
            JobKind::Dispatch {
                message_id: Uuid::new_v4(),
            },
        );
        db.enqueue_job(&job).await.unwrap();

        db.mark_job_failed(job.id, "boom").await.unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.attempts, 1);

        db.mark_job_failed(job.id, "boom").await.unwrap();
        db.mark_job_failed(job.id, "boom").await.unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.attempts, 3);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn delivery_events_respect_state_machine() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        let message = OutboundMessage::queued(
            tenant,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
            Channel::Email,
            "a@example.com",
            None,
            "b",
        );
        db.insert_message(&message).await.unwrap();

        // Queued message cannot jump to delivered.
        assert!(
            !db.apply_delivery_event(tenant, message.id, MessageStatus::Delivered, Utc::now())
                .await
                .unwrap()
        );

        db.mark_message_sent(tenant, message.id, MessageStatus::Sent, "smtp", Some("mid-1"))
            .await
            .unwrap();
        assert!(
            db.apply_delivery_event(tenant, message.id, MessageStatus::Delivered, Utc::now())
                .await
                .unwrap()
        );

        let loaded = db.get_message(tenant, message.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Delivered);
        assert!(loaded.delivered_at.is_some());
        assert_eq!(loaded.provider_message_id.as_deref(), Some("mid-1"));
    }

    #[tokio::test]
    async fn lead_pages_are_keyset_ordered() {
        let db = backend().await;
        let tenant = Uuid::new_v4();
        for i in 0..5 {
            let lead = Lead::new(tenant).with_email(format!("l{i}@example.com"));
            db.insert_lead(&lead).await.unwrap();
        }

        let first = db.list_leads_page(tenant, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].id < first[1].id);

        let second = db
            .list_leads_page(tenant, Some(first[1].id), 10)
            .await
            .unwrap();
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|l| l.id > first[1].id));
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("outreach.db");
        let tenant = Uuid::new_v4();
        let campaign = Campaign::new(tenant, "persisted", CampaignType::Broadcast, Channel::Email);

        {
            let db = LibSqlBackend::new_local(&db_path).await.unwrap();
            db.insert_campaign(&campaign).await.unwrap();
        }
        assert!(db_path.exists());

        // Reopen runs migrations again and sees the earlier write.
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        let loaded = db.get_campaign(tenant, campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "persisted");
    }
}
