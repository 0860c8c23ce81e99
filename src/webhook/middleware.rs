use std::collections::BTreeMap;

use axum::{
    body::{Body, HttpBody},
    extract::{OriginalUri, Query, RawPathParams, Request, State},
    http::header::{CONTENT_LENGTH, CONTENT_TYPE},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{event_name, merge_data, EventUser, WebhookPayload};
use crate::state::AppState;

/// Same ceiling as axum's default `Json` limit.
const MAX_BUFFERED_BODY: usize = 2 * 1024 * 1024;

/// Post-response hook: runs the request, then fires a webhook describing it.
/// The response is returned untouched whatever happens to the delivery.
pub async fn dispatch_events(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    params: Option<RawPathParams>,
    req: Request,
    next: Next,
) -> Response {
    let hooks = &state.webhooks;
    if !hooks.is_enabled() || !hooks.is_eligible(uri.path()) {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let params: Vec<(String, String)> = params
        .map(|p| p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        .unwrap_or_default();
    let query = Query::<BTreeMap<String, String>>::try_from_uri(&uri)
        .map(|Query(q)| q)
        .unwrap_or_default();

    let (req, body) = buffer_json(req).await;
    let response = next.run(req).await;

    // Set by the session gate or by login/registration; never looked up here.
    let user_id = response.extensions().get::<EventUser>().map(|u| u.0);
    let payload = WebhookPayload {
        event: event_name(&method, uri.path()),
        method: method.to_string(),
        path: uri.path().to_string(),
        status_code: response.status().as_u16(),
        data: merge_data(body, query, params),
        user_id,
        timestamp: OffsetDateTime::now_utc(),
    };
    hooks.dispatch(payload);

    response
}

/// Reads a JSON body so it can be forwarded, then puts the bytes back for
/// the handler. Other content types, and bodies whose size is unknown or over
/// the limit, pass through unread so the handler sees exactly what was sent.
async fn buffer_json(req: Request) -> (Request, Option<Value>) {
    let is_json = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return (req, None);
    }
    match declared_len(&req) {
        Some(len) if len <= MAX_BUFFERED_BODY as u64 => {}
        _ => {
            debug!("webhook skipped body of unknown or oversized length");
            return (req, None);
        }
    }

    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).ok();
            (Request::from_parts(parts, Body::from(bytes)), value)
        }
        Err(e) => {
            warn!(error = %e, "webhook could not buffer request body");
            (Request::from_parts(parts, Body::empty()), None)
        }
    }
}

/// `Content-Length`, else the body's exact size hint.
fn declared_len(req: &Request) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| req.body().size_hint().exact())
}
