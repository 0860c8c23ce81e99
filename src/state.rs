use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::reset::{HttpMailer, LogNotifier, PasswordResetService, ResetNotifier};
use crate::auth::session::{PgSessionStore, SessionManager, SessionStore};
use crate::config::AppConfig;
use crate::db;
use crate::storage::{S3Storage, StorageClient};
use crate::users::repo::{PgUserRepository, UserRepository};
use crate::webhook::WebhookDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserRepository>,
    pub sessions: SessionManager,
    pub resets: PasswordResetService,
    pub webhooks: WebhookDispatcher,
    /// Absent when no bucket is configured; avatar routes answer 503.
    pub storage: Option<Arc<dyn StorageClient>>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let pool = db::connect(&config.database_url).await?;
        db::migrate(&pool).await?;

        let notifier: Arc<dyn ResetNotifier> = match &config.mail {
            Some(mail) => Arc::new(HttpMailer::new(mail.clone())?),
            None => {
                warn!("MAIL_API_URL not set; reset links are only logged");
                Arc::new(LogNotifier)
            }
        };

        let storage = match &config.storage {
            Some(cfg) => Some(Arc::new(S3Storage::from_config(cfg).await?) as Arc<dyn StorageClient>),
            None => {
                info!("object storage not configured; avatar upload disabled");
                None
            }
        };

        Self::from_parts(
            config,
            Arc::new(PgUserRepository::new(pool.clone())),
            Arc::new(PgSessionStore::new(pool)),
            notifier,
            storage,
        )
    }

    /// Wires services over the given backends. Used by `init` and by tests.
    pub fn from_parts(
        config: AppConfig,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        notifier: Arc<dyn ResetNotifier>,
        storage: Option<Arc<dyn StorageClient>>,
    ) -> anyhow::Result<Self> {
        let sessions = SessionManager::new(sessions, &config.session);
        let resets = PasswordResetService::new(users.clone(), notifier, &config.reset);
        let webhooks =
            WebhookDispatcher::new(config.webhook.clone(), &config.webhook_excluded_prefix)?;

        Ok(Self {
            config: Arc::new(config),
            users,
            sessions,
            resets,
            webhooks,
            storage,
        })
    }
}
