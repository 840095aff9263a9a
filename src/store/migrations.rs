//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                campaign_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                channel TEXT NOT NULL,
                segment_id TEXT,
                template_id TEXT,
                start_at TEXT,
                end_at TEXT,
                launched_at TEXT,
                stop_rules TEXT NOT NULL DEFAULT '{}',
                archived_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_tenant ON campaigns(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(tenant_id, status);

            CREATE TABLE IF NOT EXISTS campaign_steps (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id),
                position INTEGER NOT NULL,
                channel TEXT NOT NULL,
                delay_minutes INTEGER NOT NULL DEFAULT 0 CHECK (delay_minutes >= 0),
                active INTEGER NOT NULL DEFAULT 1,
                template_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_steps_campaign
                ON campaign_steps(tenant_id, campaign_id, position);

            CREATE TABLE IF NOT EXISTS segments (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                rules TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_segments_tenant ON segments(tenant_id);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_tenant_id ON leads(tenant_id, id);

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_templates_tenant ON templates(tenant_id);
        "#,
    },
    Migration {
        version: 2,
        name: "messages_and_history",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                step_id TEXT,
                lead_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                direction TEXT NOT NULL DEFAULT 'outbound',
                status TEXT NOT NULL DEFAULT 'queued',
                destination TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                provider TEXT,
                provider_message_id TEXT,
                error_message TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                delivered_at TEXT,
                opened_at TEXT,
                clicked_at TEXT,
                failed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedup
                ON messages(tenant_id, campaign_id, COALESCE(step_id, ''), lead_id, channel, direction);
            CREATE INDEX IF NOT EXISTS idx_messages_campaign_status
                ON messages(tenant_id, campaign_id, status);
            CREATE INDEX IF NOT EXISTS idx_messages_lead_channel
                ON messages(tenant_id, lead_id, channel, created_at);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_lead_channel
                ON inbound_messages(tenant_id, lead_id, channel, received_at);

            CREATE TABLE IF NOT EXISTS suppressions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suppressions_lead
                ON suppressions(tenant_id, lead_id, channel, active);
        "#,
    },
    Migration {
        version: 3,
        name: "audit_and_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_subject
                ON audit_log(tenant_id, subject_type, subject_id, created_at);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);
        "#,
    },
];

/// Run all migrations newer than the recorded schema version.
pub async fn run(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration {}: {e}",
                migration.version
            ))
        })?;
    }

    Ok(())
}

/// Highest applied migration version, or 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read schema version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
