use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl_minutes: i64,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetConfig {
    pub ttl_hours: i64,
    /// Base URL of the client, used to build reset links.
    pub app_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub session: SessionConfig,
    pub reset: ResetConfig,
    pub webhook: Option<WebhookConfig>,
    /// Requests under this prefix never reach the webhook dispatcher.
    pub webhook_excluded_prefix: String,
    pub mail: Option<MailConfig>,
    pub storage: Option<StorageConfig>,
    pub cors_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET").context("SESSION_SECRET is not set")?,
            ttl_minutes: parse_or("SESSION_TTL_MINUTES", 60 * 24 * 7),
            cookie_name: std::env::var("SESSION_COOKIE_NAME").unwrap_or_else(|_| "sid".into()),
            cookie_secure: std::env::var("SESSION_COOKIE_SECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        };
        let reset = ResetConfig {
            ttl_hours: parse_or("RESET_TOKEN_TTL_HOURS", 1),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5173".into()),
        };
        let webhook = non_empty("WEBHOOK_URL").map(|url| WebhookConfig {
            url,
            api_key: non_empty("WEBHOOK_API_KEY"),
        });
        let mail = non_empty("MAIL_API_URL").map(|api_url| MailConfig {
            api_url,
            api_key: non_empty("MAIL_API_KEY"),
            from: std::env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@localhost".into()),
        });
        let storage = match non_empty("MINIO_ENDPOINT") {
            Some(endpoint) => Some(StorageConfig {
                endpoint,
                bucket: std::env::var("MINIO_BUCKET").context("MINIO_BUCKET is not set")?,
                access_key: std::env::var("MINIO_ACCESS_KEY")
                    .context("MINIO_ACCESS_KEY is not set")?,
                secret_key: std::env::var("MINIO_SECRET_KEY")
                    .context("MINIO_SECRET_KEY is not set")?,
            }),
            None => None,
        };

        Ok(Self {
            database_url,
            session,
            reset,
            webhook,
            webhook_excluded_prefix: std::env::var("WEBHOOK_EXCLUDED_PREFIX")
                .unwrap_or_else(|_| "/api/socket.io".into()),
            mail,
            storage,
            cors_origin: non_empty("CORS_ORIGIN"),
        })
    }
}

fn parse_or(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
