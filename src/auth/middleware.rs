use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

use crate::{error::AppError, state::AppState, webhook::EventUser};

/// Id of the caller, put in place by [`require_auth`].
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .copied()
            .ok_or_else(AppError::unauthenticated)
    }
}

/// Session gate for protected routes. Runs before the handler, so a rejected
/// request never reaches code that mutates anything. The resolved user is
/// also tagged on the response for the webhook layer.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(cookie) = state.sessions.cookie.extract(req.headers()) else {
        debug!(uri = %req.uri(), "request without session cookie");
        return Err(AppError::unauthenticated());
    };
    let user_id = state
        .sessions
        .resolve(&cookie)
        .await?
        .ok_or_else(AppError::unauthenticated)?;

    req.extensions_mut().insert(AuthUser(user_id));
    let mut resp = next.run(req).await;
    if resp.extensions().get::<EventUser>().is_none() {
        resp.extensions_mut().insert(EventUser(user_id));
    }
    Ok(resp)
}
