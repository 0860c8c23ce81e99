use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use super::{
    avatar,
    dto::{
        CreateUserRequest, DeletedResponse, ListQuery, UpdateUserRequest, UserListResponse,
        UserResponse, MAX_LIMIT,
    },
    model::{NewUser, User, UserFilter, UserPatch},
};
use crate::{
    auth::{middleware::require_auth, password, AuthUser},
    error::{AppError, AppResult},
    state::AppState,
    validation::{parse_id, ValidatedJson, ValidatedQuery, Validator},
};

pub fn user_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route(
            "/users/:id/avatar",
            post(upload_avatar)
                .get(get_avatar)
                .layer(DefaultBodyLimit::max(avatar::MAX_AVATAR_BYTES + 64 * 1024)),
        )
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

async fn load(state: &AppState, raw_id: &str) -> AppResult<User> {
    let id = parse_id(raw_id)?;
    state
        .users
        .find_by_id(id)
        .await?
        .ok_or(AppError::NotFound("User not found"))
}

#[instrument(skip(state, q))]
pub async fn list_users(
    State(state): State<AppState>,
    ValidatedQuery(q): ValidatedQuery<ListQuery>,
) -> AppResult<Json<UserListResponse>> {
    let filter = UserFilter {
        role: q.role,
        status: q.status,
        search: q.search.filter(|s| !s.trim().is_empty()),
        limit: q.limit.clamp(1, MAX_LIMIT),
        offset: q.offset.max(0),
    };
    let users = state.users.list(&filter).await?;
    Ok(Json(UserListResponse {
        users: users.into_iter().map(Into::into).collect(),
    }))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<UserResponse>> {
    let user = load(&state, &id).await?;
    Ok(Json(UserResponse { user: user.into() }))
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ValidatedJson(payload): ValidatedJson<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    let email = payload.email.trim().to_string();
    let name = payload.name.trim().to_string();
    Validator::new()
        .email("email", &email)
        .required("name", &name)
        .password("password", &payload.password)
        .finish()?;

    if state.users.find_by_email(&email).await?.is_some() {
        warn!(%email, "create user with taken email");
        return Err(AppError::Conflict("Email already registered".into()));
    }

    let password_hash = password::hash(&payload.password).await?;
    let user = state
        .users
        .create(NewUser {
            email,
            password_hash,
            name,
            role: payload.role,
            status: payload.status,
            external_id: payload.external_id.filter(|s| !s.trim().is_empty()),
        })
        .await?;

    info!(%actor, user_id = %user.id, "user created");
    Ok((StatusCode::CREATED, Json(UserResponse { user: user.into() })))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    ValidatedJson(payload): ValidatedJson<UpdateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    let id = parse_id(&id)?;
    let email = payload.email.map(|e| e.trim().to_string());
    let name = payload.name.map(|n| n.trim().to_string());

    let mut v = Validator::new();
    if let Some(email) = &email {
        v.email("email", email);
    }
    if let Some(name) = &name {
        v.required("name", name);
    }
    if let Some(password) = &payload.password {
        v.password("password", password);
    }
    v.finish()?;

    let password_hash = match &payload.password {
        Some(p) => Some(password::hash(p).await?),
        None => None,
    };
    let patch = UserPatch {
        email,
        name,
        role: payload.role,
        status: payload.status,
        external_id: payload.external_id.filter(|s| !s.trim().is_empty()),
        password_hash,
    };
    if patch.is_empty() {
        return Err(AppError::field("body", "Nothing to update"));
    }

    let user = state
        .users
        .update(id, patch)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;
    info!(%actor, user_id = %user.id, "user updated");
    Ok(Json(UserResponse { user: user.into() }))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<DeletedResponse>> {
    let id = parse_id(&id)?;
    let user = state
        .users
        .delete(id)
        .await?
        .ok_or(AppError::NotFound("User not found"))?;

    if let (Some(key), Some(storage)) = (&user.avatar, state.storage.as_deref()) {
        avatar::remove_object(storage, key).await;
    }
    info!(%actor, user_id = %user.id, "user deleted");
    Ok(Json(DeletedResponse { success: true }))
}

#[instrument(skip(state, mp))]
pub async fn upload_avatar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut mp: Multipart,
) -> AppResult<Json<UserResponse>> {
    let storage = state
        .storage
        .as_deref()
        .ok_or(AppError::Unavailable("Avatar storage is not configured"))?;
    let user = load(&state, &id).await?;

    let mut upload = None;
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| AppError::field("avatar", &e.body_text()))?
    {
        if field.name() == Some("avatar") {
            let content_type = field.content_type().unwrap_or_default().to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::field("avatar", &e.body_text()))?;
            upload = Some((data, content_type));
            break;
        }
    }
    let (data, content_type) =
        upload.ok_or_else(|| AppError::field("avatar", "This field is required"))?;

    let updated =
        avatar::replace_avatar(storage, state.users.as_ref(), &user, data, &content_type).await?;
    Ok(Json(UserResponse {
        user: updated.into(),
    }))
}

#[instrument(skip(state))]
pub async fn get_avatar(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Redirect> {
    let user = load(&state, &id).await?;
    let key = user.avatar.ok_or(AppError::NotFound("Avatar not found"))?;
    let storage = state
        .storage
        .as_deref()
        .ok_or(AppError::Unavailable("Avatar storage is not configured"))?;
    let url = avatar::presign(storage, &key).await?;
    Ok(Redirect::temporary(&url))
}
