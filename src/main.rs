use std::sync::Arc;

use outreach::api::{AppState, api_routes};
use outreach::config::{EngineConfig, HttpApiConfig, SmtpConfig, WebhookGatewayConfig};
use outreach::engine::{CampaignScheduler, DispatchService, MessageGenerator};
use outreach::model::Channel;
use outreach::providers::{DispatcherRegistry, SmtpDispatcher, WebhookDispatcher};
use outreach::render::VariableRenderer;
use outreach::store::{Database, LibSqlBackend};
use outreach::worker::{JobRunner, RunnerDeps, spawn_runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();
    let http_port = HttpApiConfig::from_env().port;

    eprintln!("Outreach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", http_port);
    eprintln!(
        "   Worker: every {}s, up to {} parallel jobs",
        config.poll_interval.as_secs(),
        config.max_parallel_jobs
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("OUTREACH_DB_PATH").unwrap_or_else(|_| "./data/outreach.db".to_string());

    let db_path_ref = std::path::Path::new(&db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );

    eprintln!("   Database: {}", db_path);

    // ── Dispatchers ──────────────────────────────────────────────────────
    let mut registry = DispatcherRegistry::new();
    let mut active_providers = Vec::new();

    if let Some(smtp_config) = SmtpConfig::from_env() {
        eprintln!(
            "   Email: enabled (SMTP: {}:{}, from: {})",
            smtp_config.host, smtp_config.port, smtp_config.from_address
        );
        registry.register(Channel::Email, Arc::new(SmtpDispatcher::new(smtp_config)));
        active_providers.push("email");
    }

    if let Some(sms_config) = WebhookGatewayConfig::from_env("OUTREACH_SMS") {
        eprintln!("   SMS: enabled (gateway: {})", sms_config.endpoint);
        registry.register(
            Channel::Sms,
            Arc::new(WebhookDispatcher::new("sms-gateway", sms_config)),
        );
        active_providers.push("sms");
    }

    if let Some(wa_config) = WebhookGatewayConfig::from_env("OUTREACH_WHATSAPP") {
        eprintln!("   WhatsApp: enabled (gateway: {})", wa_config.endpoint);
        registry.register(
            Channel::Whatsapp,
            Arc::new(WebhookDispatcher::new("whatsapp-gateway", wa_config)),
        );
        active_providers.push("whatsapp");
    }

    if active_providers.is_empty() {
        eprintln!("   Providers: none configured (messages to any channel will fail)");
    } else {
        eprintln!("   Providers: {}\n", active_providers.join(", "));
    }

    // ── Engine ───────────────────────────────────────────────────────────
    let scheduler = Arc::new(CampaignScheduler::new(Arc::clone(&db)));
    let generator = Arc::new(MessageGenerator::new(
        Arc::clone(&db),
        Arc::new(VariableRenderer),
        config.batch_size,
    ));
    let dispatch = Arc::new(DispatchService::new(
        Arc::clone(&db),
        registry,
        config.max_dispatch_attempts,
    ));

    // ── HTTP API ─────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        db: Arc::clone(&db),
        scheduler,
        generator: Arc::clone(&generator),
        dispatch: Arc::clone(&dispatch),
    });
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port))
            .await
            .expect("Failed to bind API port");
        tracing::info!(port = http_port, "API server started");
        axum::serve(listener, app).await.ok();
    });

    // ── Job Runner ───────────────────────────────────────────────────────
    let runner = Arc::new(JobRunner::new(
        RunnerDeps {
            db,
            generator,
            dispatch,
        },
        config,
    ));
    spawn_runner(runner).await?;

    Ok(())
}
