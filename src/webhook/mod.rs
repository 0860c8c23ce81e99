//! Best-effort webhook notifications for API calls.
//!
//! After the router has produced a response, [`middleware::dispatch_events`]
//! builds a [`WebhookPayload`] and hands it to [`WebhookDispatcher::dispatch`],
//! which posts it on a detached task. Nothing here can change what the
//! client receives.

pub mod middleware;

use std::{sync::Arc, time::Duration};

use axum::http::Method;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::WebhookConfig, error::DeliveryError};

/// Keys dropped from the forwarded data.
const REDACTED_KEYS: &[&str] = &["password", "currentPassword", "newPassword", "token"];

/// Response extension naming the acting user. Set by login and registration
/// for the user they authenticate, and by the session gate for everything
/// behind it.
#[derive(Debug, Clone, Copy)]
pub struct EventUser(pub Uuid);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub data: Map<String, Value>,
    pub user_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    target: Option<Arc<WebhookConfig>>,
    excluded_prefix: String,
}

impl WebhookDispatcher {
    pub fn new(target: Option<WebhookConfig>, excluded_prefix: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            target: target.map(Arc::new),
            excluded_prefix: excluded_prefix.to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_eligible(&self, path: &str) -> bool {
        path.starts_with("/api/") && !path.starts_with(&self.excluded_prefix)
    }

    /// Posts `payload` on a detached task. The handle is only for tests;
    /// the request path never awaits it.
    pub fn dispatch(&self, payload: WebhookPayload) -> Option<JoinHandle<()>> {
        let target = self.target.clone()?;
        let client = self.client.clone();
        Some(tokio::spawn(async move {
            let event = payload.event.clone();
            match deliver(&client, &target, &payload).await {
                Ok(()) => debug!(%event, "webhook delivered"),
                Err(e) => warn!(%event, error = %e, "webhook delivery failed"),
            }
        }))
    }
}

async fn deliver(
    client: &reqwest::Client,
    target: &WebhookConfig,
    payload: &WebhookPayload,
) -> Result<(), DeliveryError> {
    let mut req = client.post(&target.url).json(payload);
    if let Some(key) = &target.api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(DeliveryError::Status(resp.status()));
    }
    Ok(())
}

/// `PATCH /api/users/<uuid>` -> `users.patch`.
pub fn event_name(method: &Method, path: &str) -> String {
    let method = method.as_str().to_ascii_lowercase();
    let trimmed = path.strip_prefix("/api/").unwrap_or(path);
    let mut parts: Vec<&str> = trimmed
        .split('/')
        .filter(|seg| !seg.is_empty() && !looks_like_id(seg))
        .collect();
    parts.push(&method);
    parts.join(".")
}

/// UUIDs, numbers, and long hex strings (object ids, tokens).
fn looks_like_id(seg: &str) -> bool {
    Uuid::parse_str(seg).is_ok()
        || seg.bytes().all(|b| b.is_ascii_digit())
        || (seg.len() >= 24 && seg.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Body fields, then query parameters, then path parameters; later sources
/// win on key clashes. Credential fields are removed.
pub fn merge_data(
    body: Option<Value>,
    query: impl IntoIterator<Item = (String, String)>,
    params: impl IntoIterator<Item = (String, String)>,
) -> Map<String, Value> {
    let mut data = match body {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("body".into(), other);
            map
        }
        None => Map::new(),
    };
    for (k, v) in query.into_iter().chain(params) {
        data.insert(k, Value::String(v));
    }
    for key in REDACTED_KEYS {
        data.remove(*key);
    }
    data
}
