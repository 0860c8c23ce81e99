use axum::Router;

use crate::state::AppState;

pub mod cookie;
pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod password;
pub mod reset;
pub mod session;
pub mod token;

pub use middleware::AuthUser;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::session_routes(state))
}
