//! Password-reset token lifecycle.
//!
//! A user either has no token, or exactly one live `(token, expiry)` pair.
//! Issuing a new pair supersedes the old one. Consuming clears the pair in the
//! same statement that writes the new password. Expiry is detected lazily:
//! whichever lookup sees an elapsed pair clears it and reports `Expired`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{password, token};
use crate::{
    config::{MailConfig, ResetConfig},
    error::{AppError, AppResult, DeliveryError},
    users::{
        model::User,
        repo::{RepoResult, UserRepository},
    },
};

#[derive(Debug)]
pub enum TokenCheck {
    Valid(User),
    Invalid,
    Expired,
}

impl TokenCheck {
    pub fn into_user(self) -> AppResult<User> {
        match self {
            TokenCheck::Valid(user) => Ok(user),
            TokenCheck::Invalid => Err(AppError::TokenInvalid),
            TokenCheck::Expired => Err(AppError::TokenExpired),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResetMessage {
    pub email: String,
    pub name: String,
    pub token: String,
    pub link: String,
}

#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset(&self, message: &ResetMessage) -> Result<(), DeliveryError>;
}

/// Posts the reset mail to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailConfig,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ResetNotifier for HttpMailer {
    async fn send_reset(&self, message: &ResetMessage) -> Result<(), DeliveryError> {
        let body = json!({
            "from": self.config.from,
            "to": message.email,
            "subject": "Password reset",
            "text": format!(
                "Hello {},\n\nUse the link below to choose a new password:\n{}\n\n\
                 If you did not ask for this, ignore this message.",
                message.name, message.link
            ),
        });
        let mut req = self.client.post(&self.config.api_url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(DeliveryError::Status(resp.status()));
        }
        Ok(())
    }
}

/// Used when no mail relay is configured.
pub struct LogNotifier;

#[async_trait]
impl ResetNotifier for LogNotifier {
    async fn send_reset(&self, message: &ResetMessage) -> Result<(), DeliveryError> {
        info!(email = %message.email, "password reset issued; no mail relay configured");
        Ok(())
    }
}

#[derive(Clone)]
pub struct PasswordResetService {
    users: Arc<dyn UserRepository>,
    notifier: Arc<dyn ResetNotifier>,
    ttl_hours: i64,
    app_base_url: String,
}

impl PasswordResetService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        notifier: Arc<dyn ResetNotifier>,
        cfg: &ResetConfig,
    ) -> Self {
        Self {
            users,
            notifier,
            ttl_hours: cfg.ttl_hours,
            app_base_url: cfg.app_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn reset_link(&self, token: &str) -> String {
        format!("{}/reset-password?token={}", self.app_base_url, token)
    }

    /// Issues a fresh token for `email` if it belongs to a user and tries to
    /// deliver it. Returns whether a token was issued; delivery failures are
    /// logged and do not undo issuance.
    #[instrument(skip(self, email))]
    pub async fn request_reset(&self, email: &str) -> RepoResult<bool> {
        let Some(user) = self.users.find_by_email(email).await? else {
            debug!("password reset requested for unknown email");
            return Ok(false);
        };

        let token = token::generate();
        let expiry = token::expiry_from(OffsetDateTime::now_utc(), self.ttl_hours);
        self.users.set_reset_token(user.id, &token, expiry).await?;
        info!(user_id = %user.id, "password reset token issued");

        let message = ResetMessage {
            email: user.email,
            name: user.name,
            link: self.reset_link(&token),
            token,
        };
        if let Err(e) = self.notifier.send_reset(&message).await {
            warn!(user_id = %user.id, error = %e, "password reset delivery failed");
        }
        Ok(true)
    }

    /// Validate-only lookup. Side-effect free apart from clearing an
    /// elapsed token.
    pub async fn check(&self, token: &str) -> RepoResult<TokenCheck> {
        if !token::is_well_formed(token) {
            return Ok(TokenCheck::Invalid);
        }
        let Some(user) = self.users.find_by_reset_token(token).await? else {
            return Ok(TokenCheck::Invalid);
        };
        // Exact match only; the index lookup already guarantees it, this
        // keeps other repository implementations honest.
        if user.reset_token.as_deref() != Some(token) {
            return Ok(TokenCheck::Invalid);
        }
        match user.reset_token_expiry {
            Some(expiry) if expiry > OffsetDateTime::now_utc() => Ok(TokenCheck::Valid(user)),
            _ => {
                self.users.clear_reset_token(user.id).await?;
                debug!(user_id = %user.id, "expired reset token cleared");
                Ok(TokenCheck::Expired)
            }
        }
    }

    /// Sets a new password if `token` is live and retires the token.
    /// Returns the user whose password changed.
    #[instrument(skip_all)]
    pub async fn consume(&self, token: &str, new_password: &str) -> AppResult<Uuid> {
        let user = self.check(token).await?.into_user()?;
        let digest = password::hash(new_password).await?;
        let done = self
            .users
            .consume_reset_token(user.id, token, &digest, OffsetDateTime::now_utc())
            .await?;
        if !done {
            // Consumed or superseded between lookup and update.
            return Err(AppError::TokenInvalid);
        }
        info!(user_id = %user.id, "password reset completed");
        Ok(user.id)
    }
}
