//! In-memory backends and an HTTP harness for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use bytes::Bytes;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    app::build_app,
    auth::{
        password,
        reset::{ResetMessage, ResetNotifier},
        session::{Session, SessionStore},
    },
    config::{AppConfig, ResetConfig, SessionConfig, WebhookConfig},
    error::DeliveryError,
    state::AppState,
    storage::StorageClient,
    users::{
        model::{NewUser, User, UserFilter, UserPatch, UserRole, UserStatus},
        repo::{RepoError, RepoResult, UserRepository},
    },
};

/// Password given to every seeded user.
pub const PASSWORD: &str = "secret1";

pub fn config() -> AppConfig {
    AppConfig {
        database_url: "postgres://unused".into(),
        session: SessionConfig {
            secret: "test-secret".into(),
            ttl_minutes: 60,
            cookie_name: "sid".into(),
            cookie_secure: false,
        },
        reset: ResetConfig {
            ttl_hours: 1,
            app_base_url: "http://localhost:5173/".into(),
        },
        webhook: None,
        webhook_excluded_prefix: "/api/socket.io".into(),
        mail: None,
        storage: None,
        cors_origin: None,
    }
}

pub async fn seed_user(users: &impl UserRepository, email: &str, password: &str) -> User {
    let name = email.split('@').next().unwrap_or(email).to_string();
    users
        .create(NewUser {
            email: email.into(),
            password_hash: password::hash(password).await.unwrap(),
            name,
            role: UserRole::Admin,
            status: UserStatus::Active,
            external_id: None,
        })
        .await
        .unwrap()
}

#[derive(Default)]
pub struct MemoryUserRepository {
    rows: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserRepository {
    pub async fn get(&self, id: Uuid) -> Option<User> {
        self.rows.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}

/// Mirrors the unique indexes on `email` and `external_id`.
fn taken(
    rows: &HashMap<Uuid, User>,
    except: Option<Uuid>,
    email: &str,
    external_id: Option<&str>,
) -> RepoResult<()> {
    for u in rows.values().filter(|u| Some(u.id) != except) {
        if u.email == email {
            return Err(RepoError::Conflict("email"));
        }
        if external_id.is_some() && u.external_id.as_deref() == external_id {
            return Err(RepoError::Conflict("externalId"));
        }
    }
    Ok(())
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.get(id).await)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let rows = self.rows.read().await;
        Ok(rows.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_reset_token(&self, token: &str) -> RepoResult<Option<User>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .find(|u| u.reset_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>> {
        let rows = self.rows.read().await;
        let mut users: Vec<User> = rows.values().filter(|u| filter.matches(u)).cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if filter.limit > 0 { filter.limit as usize } else { usize::MAX };
        Ok(users
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(limit)
            .collect())
    }

    async fn create(&self, user: NewUser) -> RepoResult<User> {
        let mut rows = self.rows.write().await;
        taken(&rows, None, &user.email, user.external_id.as_deref())?;
        let row = User {
            id: Uuid::new_v4(),
            email: user.email,
            password_hash: user.password_hash,
            name: user.name,
            role: user.role,
            status: user.status,
            avatar: None,
            external_id: user.external_id,
            last_active: None,
            created_at: OffsetDateTime::now_utc(),
            reset_token: None,
            reset_token_expiry: None,
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update(&self, id: Uuid, patch: UserPatch) -> RepoResult<Option<User>> {
        let mut rows = self.rows.write().await;
        let Some(current) = rows.get(&id) else {
            return Ok(None);
        };
        let email = patch.email.clone().unwrap_or_else(|| current.email.clone());
        let external_id = patch.external_id.clone().or_else(|| current.external_id.clone());
        taken(&rows, Some(id), &email, external_id.as_deref())?;

        let Some(row) = rows.get_mut(&id) else {
            return Ok(None);
        };
        row.email = email;
        row.external_id = external_id;
        if let Some(name) = patch.name {
            row.name = name;
        }
        if let Some(role) = patch.role {
            row.role = role;
        }
        if let Some(status) = patch.status {
            row.status = status;
        }
        if let Some(hash) = patch.password_hash {
            row.password_hash = hash;
            row.reset_token = None;
            row.reset_token_expiry = None;
        }
        Ok(Some(row.clone()))
    }

    async fn delete(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.rows.write().await.remove(&id))
    }

    async fn touch_last_active(&self, id: Uuid, at: OffsetDateTime) -> RepoResult<()> {
        if let Some(row) = self.rows.write().await.get_mut(&id) {
            row.last_active = Some(at);
        }
        Ok(())
    }

    async fn set_avatar(&self, id: Uuid, key: Option<&str>) -> RepoResult<Option<User>> {
        let mut rows = self.rows.write().await;
        Ok(rows.get_mut(&id).map(|row| {
            row.avatar = key.map(str::to_string);
            row.clone()
        }))
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> RepoResult<()> {
        if let Some(row) = self.rows.write().await.get_mut(&id) {
            row.reset_token = Some(token.to_string());
            row.reset_token_expiry = Some(expiry);
        }
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> RepoResult<()> {
        if let Some(row) = self.rows.write().await.get_mut(&id) {
            row.reset_token = None;
            row.reset_token_expiry = None;
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        id: Uuid,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> RepoResult<bool> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        let live = row.reset_token.as_deref() == Some(token)
            && row.reset_token_expiry.is_some_and(|exp| exp > now);
        if live {
            row.password_hash = password_hash.to_string();
            row.reset_token = None;
            row.reset_token_expiry = None;
        }
        Ok(live)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    rows: RwLock<HashMap<String, Session>>,
    finds: AtomicUsize,
}

impl MemorySessionStore {
    /// Moves every session's expiry into the past.
    pub async fn expire_all(&self) {
        let past = OffsetDateTime::now_utc() - Duration::minutes(1);
        for s in self.rows.write().await.values_mut() {
            s.expires_at = past;
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Number of `find` lookups served so far.
    pub fn find_calls(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &Session) -> anyhow::Result<()> {
        self.rows
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> anyhow::Result<Option<Session>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.rows.write().await.remove(id);
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<()> {
        self.rows.write().await.retain(|_, s| s.user_id != user_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ResetMessage>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<ResetMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn last_token(&self) -> Option<String> {
        self.sent.lock().await.last().map(|m| m.token.clone())
    }
}

#[async_trait]
impl ResetNotifier for RecordingNotifier {
    async fn send_reset(&self, message: &ResetMessage) -> Result<(), DeliveryError> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Relay that is always down.
pub struct FailingNotifier;

#[async_trait]
impl ResetNotifier for FailingNotifier {
    async fn send_reset(&self, _message: &ResetMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Status(reqwest::StatusCode::BAD_GATEWAY))
    }
}

#[derive(Default)]
pub struct FakeStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl FakeStorage {
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn put_object(&self, key: &str, body: Bytes, _content_type: &str) -> anyhow::Result<()> {
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, _seconds: u64) -> anyhow::Result<String> {
        Ok(format!("https://fake.local/{key}"))
    }
}

/// Full router over in-memory backends, driven with `oneshot`.
pub struct TestApp {
    pub app: Router,
    pub users: Arc<MemoryUserRepository>,
    pub sessions: Arc<MemorySessionStore>,
    pub outbox: Arc<RecordingNotifier>,
    pub storage: Arc<FakeStorage>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::from_config(config())
    }

    pub fn with_webhook(webhook: Option<WebhookConfig>) -> Self {
        let mut cfg = config();
        cfg.webhook = webhook;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: AppConfig) -> Self {
        let users = Arc::new(MemoryUserRepository::default());
        let sessions = Arc::new(MemorySessionStore::default());
        let outbox = Arc::new(RecordingNotifier::default());
        let storage = Arc::new(FakeStorage::default());
        let state = AppState::from_parts(
            cfg,
            users.clone(),
            sessions.clone(),
            outbox.clone(),
            Some(storage.clone() as Arc<dyn StorageClient>),
        )
        .unwrap();
        Self {
            app: build_app(state),
            users,
            sessions,
            outbox,
            storage,
        }
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Value,
        cookie: Option<&str>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        self.send(req.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: Value,
        cookie: Option<&str>,
    ) -> (StatusCode, HeaderMap, Value) {
        self.send_json(Method::POST, path, body, cookie).await
    }

    pub async fn get(&self, path: &str, cookie: Option<&str>) -> (StatusCode, HeaderMap, Value) {
        let mut req = Request::builder().method(Method::GET).uri(path);
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    /// `name=value` pair from a `Set-Cookie` response header.
    pub fn session_cookie(headers: &HeaderMap) -> String {
        let raw = headers[header::SET_COOKIE].to_str().unwrap();
        raw.split(';').next().unwrap().to_string()
    }

    /// Logs in over HTTP and returns the cookie to send back.
    pub async fn login(&self, email: &str, password: &str) -> (String, Value) {
        let (status, headers, body) = self
            .post_json(
                "/api/auth/login",
                serde_json::json!({ "email": email, "password": password }),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        (Self::session_cookie(&headers), body)
    }

    /// Seeds an admin with [`PASSWORD`] and logs in as them.
    pub async fn sign_in(&self, email: &str) -> (String, User) {
        let user = seed_user(self.users.as_ref(), email, PASSWORD).await;
        let (cookie, _) = self.login(email, PASSWORD).await;
        (cookie, user)
    }
}
