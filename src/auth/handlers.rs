use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use super::{
    dto::{
        AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest,
        MessageResponse, RegisterRequest, ResetPasswordRequest, ValidateTokenResponse,
    },
    middleware::{require_auth, AuthUser},
    password,
    reset::TokenCheck,
};
use crate::{
    error::{AppError, AppResult},
    state::AppState,
    users::model::{NewUser, User, UserPatch, UserRole, UserStatus},
    validation::{ValidatedJson, Validator},
    webhook::EventUser,
};

/// Same body whether or not the address belongs to an account.
const FORGOT_PASSWORD_MESSAGE: &str =
    "If this email is registered, you will receive instructions to reset your password";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/validate-token/:token", get(validate_token))
}

pub fn session_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(get_me))
        .route("/auth/change-password", post(change_password))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

/// Opens a session for `user` and builds the login/registration response.
async fn signed_in(state: &AppState, mut user: User) -> AppResult<Response> {
    let cookie = state.sessions.start(user.id).await?;
    let now = OffsetDateTime::now_utc();
    state.users.touch_last_active(user.id, now).await?;
    user.last_active = Some(now);

    let user_id = user.id;
    let mut resp = Json(AuthResponse { user: user.into() }).into_response();
    resp.headers_mut()
        .insert(header::SET_COOKIE, state.sessions.cookie.header(&cookie));
    resp.extensions_mut().insert(EventUser(user_id));
    Ok(resp)
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> AppResult<Response> {
    let email = payload.email.trim().to_string();
    let name = payload.name.trim().to_string();
    Validator::new()
        .email("email", &email)
        .required("name", &name)
        .password("password", &payload.password)
        .finish()?;

    // Checked before hashing; the unique constraint still covers races.
    if state.users.find_by_email(&email).await?.is_some() {
        warn!(%email, "email already registered");
        return Err(AppError::Conflict("Email already registered".into()));
    }

    let password_hash = password::hash(&payload.password).await?;
    let user = state
        .users
        .create(NewUser {
            email,
            password_hash,
            name,
            role: UserRole::Client,
            status: UserStatus::Active,
            external_id: None,
        })
        .await?;

    info!(user_id = %user.id, "user registered");
    signed_in(&state, user).await
}

fn bad_credentials() -> AppError {
    AppError::Authentication("Invalid email or password")
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> AppResult<Response> {
    let email = payload.email.trim().to_string();
    Validator::new()
        .email("email", &email)
        .required("password", &payload.password)
        .finish()?;

    let Some(user) = state.users.find_by_email(&email).await? else {
        warn!("login with unknown email");
        return Err(bad_credentials());
    };
    if !password::verify(&payload.password, &user.password_hash).await {
        warn!(user_id = %user.id, "login with wrong password");
        return Err(bad_credentials());
    }
    if user.status == UserStatus::Inactive {
        warn!(user_id = %user.id, "login to inactive account");
        return Err(AppError::Forbidden("Account is inactive"));
    }

    info!(user_id = %user.id, "user logged in");
    signed_in(&state, user).await
}

#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    headers: HeaderMap,
) -> AppResult<Response> {
    if let Some(cookie) = state.sessions.cookie.extract(&headers) {
        state.sessions.end(&cookie).await?;
    }
    info!(%user_id, "user logged out");

    let mut resp = Json(MessageResponse {
        message: "Logged out",
    })
    .into_response();
    resp.headers_mut()
        .insert(header::SET_COOKIE, state.sessions.cookie.removal_header());
    Ok(resp)
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<AuthResponse>> {
    // A live session for a deleted user is treated as no session.
    let user = state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(AppError::unauthenticated)?;
    Ok(Json(AuthResponse { user: user.into() }))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ValidatedJson(payload): ValidatedJson<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    Validator::new()
        .required("currentPassword", &payload.current_password)
        .password("newPassword", &payload.new_password)
        .finish()?;

    let user = state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(AppError::unauthenticated)?;
    if !password::verify(&payload.current_password, &user.password_hash).await {
        warn!(%user_id, "change password with wrong current password");
        return Err(AppError::Authentication("Current password is incorrect"));
    }

    let password_hash = password::hash(&payload.new_password).await?;
    state
        .users
        .update(
            user_id,
            UserPatch {
                password_hash: Some(password_hash),
                ..Default::default()
            },
        )
        .await?;

    info!(%user_id, "password changed");
    Ok(Json(MessageResponse {
        message: "Password changed successfully",
    }))
}

/// Answers at once; lookup, token issuance and delivery run detached so the
/// response cannot reveal whether the account exists.
#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ForgotPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    let email = payload.email.trim().to_string();
    Validator::new().email("email", &email).finish()?;

    let resets = state.resets.clone();
    tokio::spawn(async move {
        if let Err(e) = resets.request_reset(&email).await {
            error!(error = %e, "password reset request failed");
        }
    });

    Ok(Json(MessageResponse {
        message: FORGOT_PASSWORD_MESSAGE,
    }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<ResetPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    Validator::new()
        .password("password", &payload.password)
        .finish()?;

    let user_id = state
        .resets
        .consume(payload.token.trim(), &payload.password)
        .await?;
    state.sessions.end_all(user_id).await?;

    Ok(Json(MessageResponse {
        message: "Password reset successfully",
    }))
}

#[instrument(skip_all)]
pub async fn validate_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<ValidateTokenResponse>> {
    let resp = match state.resets.check(&token).await? {
        TokenCheck::Valid(_) => ValidateTokenResponse {
            valid: true,
            message: None,
        },
        TokenCheck::Invalid => ValidateTokenResponse {
            valid: false,
            message: Some(AppError::TokenInvalid.to_string()),
        },
        TokenCheck::Expired => ValidateTokenResponse {
            valid: false,
            message: Some(AppError::TokenExpired.to_string()),
        },
    };
    Ok(Json(resp))
}
