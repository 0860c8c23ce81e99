//! Server-side sessions addressed by a signed cookie.
//!
//! The cookie carries an HS256 JWT naming the session id and its user. The
//! signature keeps clients from forging ids; the row in the session store is
//! what makes a session live, so deleting it logs the client out even though
//! the JWT would still verify.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{cookie::SessionCookie, token};
use crate::config::SessionConfig;

const ISSUER: &str = "dashboard";

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> anyhow::Result<()>;
    async fn find(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<()>;
}

pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &Session) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&session.id)
        .bind(session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, user_id, created_at, expires_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(session)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Cookie payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sid: String,
    pub sub: Uuid,
    pub iat: usize,
    pub exp: usize,
    pub iss: String,
}

#[derive(Clone)]
struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    fn sign(&self, session: &Session) -> anyhow::Result<String> {
        let claims = SessionClaims {
            sid: session.id.clone(),
            sub: session.user_id,
            iat: session.created_at.unix_timestamp() as usize,
            exp: session.expires_at.unix_timestamp() as usize,
            iss: ISSUER.to_string(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    fn verify(&self, value: &str, check_expiry: bool) -> anyhow::Result<SessionClaims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = check_expiry;
        if !check_expiry {
            validation.required_spec_claims.remove("exp");
        }
        let data = decode::<SessionClaims>(value, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    keys: SessionKeys,
    ttl: Duration,
    pub cookie: SessionCookie,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, cfg: &SessionConfig) -> Self {
        Self {
            store,
            keys: SessionKeys::new(&cfg.secret),
            ttl: Duration::minutes(cfg.ttl_minutes),
            cookie: SessionCookie::from_config(cfg),
        }
    }

    /// Creates a session for `user_id` and returns the signed cookie value.
    pub async fn start(&self, user_id: Uuid) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            id: token::generate(),
            user_id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.insert(&session).await?;
        debug!(%user_id, "session started");
        self.keys.sign(&session)
    }

    /// User id behind a cookie value, if the session is still live.
    pub async fn resolve(&self, value: &str) -> anyhow::Result<Option<Uuid>> {
        let claims = match self.keys.verify(value, true) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "session cookie rejected");
                return Ok(None);
            }
        };
        let Some(session) = self.store.find(&claims.sid).await? else {
            return Ok(None);
        };
        if session.expires_at <= OffsetDateTime::now_utc() {
            self.store.delete(&session.id).await?;
            return Ok(None);
        }
        if session.user_id != claims.sub {
            warn!(sid_user = %session.user_id, claim_user = %claims.sub, "session owner mismatch");
            return Ok(None);
        }
        Ok(Some(session.user_id))
    }

    /// Drops the session behind a cookie value. Unknown or expired values are ignored.
    pub async fn end(&self, value: &str) -> anyhow::Result<()> {
        if let Ok(claims) = self.keys.verify(value, false) {
            self.store.delete(&claims.sid).await?;
            debug!(user_id = %claims.sub, "session ended");
        }
        Ok(())
    }

    pub async fn end_all(&self, user_id: Uuid) -> anyhow::Result<()> {
        self.store.delete_for_user(user_id).await
    }
}
