//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recipient batch size for generation passes.
    pub batch_size: usize,
    /// Maximum dispatch attempts per message before it stays failed.
    pub max_dispatch_attempts: u32,
    /// Job queue poll interval.
    pub poll_interval: Duration,
    /// Maximum jobs executed concurrently by one worker process.
    pub max_parallel_jobs: usize,
    /// Jobs stuck in running state longer than this are re-queued.
    pub stuck_threshold: Duration,
    /// How many due jobs to claim per poll.
    pub claim_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_dispatch_attempts: 3,
            poll_interval: Duration::from_secs(2),
            max_parallel_jobs: 16,
            stuck_threshold: Duration::from_secs(300),
            claim_limit: 32,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            batch_size: env_parse("OUTREACH_BATCH_SIZE", defaults.batch_size),
            max_dispatch_attempts: env_parse(
                "OUTREACH_MAX_DISPATCH_ATTEMPTS",
                defaults.max_dispatch_attempts,
            ),
            poll_interval: Duration::from_secs(env_parse(
                "OUTREACH_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            max_parallel_jobs: env_parse("OUTREACH_MAX_PARALLEL_JOBS", defaults.max_parallel_jobs),
            stuck_threshold: Duration::from_secs(env_parse(
                "OUTREACH_STUCK_THRESHOLD_SECS",
                defaults.stuck_threshold.as_secs(),
            )),
            claim_limit: env_parse("OUTREACH_CLAIM_LIMIT", defaults.claim_limit),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub port: u16,
}

impl HttpApiConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("OUTREACH_HTTP_PORT", 8080),
        }
    }
}

/// SMTP provider configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_SMTP_HOST` is not set (email dispatch disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OUTREACH_SMTP_HOST").ok()?;

        let port: u16 = env_parse("OUTREACH_SMTP_PORT", 587);
        let username = std::env::var("OUTREACH_SMTP_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("OUTREACH_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("OUTREACH_SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Webhook gateway configuration for SMS/WhatsApp dispatch.
#[derive(Debug, Clone)]
pub struct WebhookGatewayConfig {
    pub endpoint: String,
    pub auth_token: Option<SecretString>,
}

impl WebhookGatewayConfig {
    /// Returns `None` if the gateway endpoint for `prefix` is not set.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let endpoint = std::env::var(format!("{prefix}_GATEWAY_URL")).ok()?;
        let auth_token = std::env::var(format!("{prefix}_GATEWAY_TOKEN"))
            .ok()
            .map(SecretString::from);

        Some(Self {
            endpoint,
            auth_token,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
