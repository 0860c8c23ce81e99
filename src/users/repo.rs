use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{NewUser, User, UserFilter, UserPatch};
use crate::error::AppError;

const USER_COLUMNS: &str = "id, email, password_hash, name, role, status, avatar, external_id, \
     last_active, created_at, reset_token, reset_token_expiry";

#[derive(Debug, Error)]
pub enum RepoError {
    /// A unique constraint rejected the write; holds the offending field.
    #[error("{0} already in use")]
    Conflict(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Field reported to the client for a violated unique constraint. Other
/// constraints are not caller errors.
fn conflict_field(constraint: Option<&str>) -> Option<&'static str> {
    match constraint? {
        "users_email_key" => Some("email"),
        "users_external_id_key" => Some("externalId"),
        _ => None,
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                if let Some(field) = conflict_field(db.constraint()) {
                    return RepoError::Conflict(field);
                }
            }
        }
        RepoError::Other(e.into())
    }
}

/// `%term%` for `LIKE ... ESCAPE '\'`, with the term's own wildcards escaped.
fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.to_lowercase().chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

impl From<RepoError> for AppError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Conflict("email") => AppError::Conflict("Email already registered".into()),
            RepoError::Conflict(field) => AppError::Conflict(format!("{field} already in use")),
            RepoError::Other(e) => AppError::Internal(e),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence boundary for users. Uniqueness and write ordering are the
/// store's job, not the caller's.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    async fn find_by_reset_token(&self, token: &str) -> RepoResult<Option<User>>;
    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>>;
    async fn create(&self, user: NewUser) -> RepoResult<User>;
    async fn update(&self, id: Uuid, patch: UserPatch) -> RepoResult<Option<User>>;
    /// Returns the deleted row so callers can clean up its avatar.
    async fn delete(&self, id: Uuid) -> RepoResult<Option<User>>;
    async fn touch_last_active(&self, id: Uuid, at: OffsetDateTime) -> RepoResult<()>;
    async fn set_avatar(&self, id: Uuid, key: Option<&str>) -> RepoResult<Option<User>>;

    /// Writes token and expiry together, replacing any previous pair.
    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> RepoResult<()>;
    async fn clear_reset_token(&self, id: Uuid) -> RepoResult<()>;
    /// Sets the password and clears the token pair only if `token` is still
    /// live at `now`. Returns false when nothing matched.
    async fn consume_reset_token(
        &self,
        id: Uuid,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> RepoResult<bool>;
}

pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_reset_token(&self, token: &str) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE reset_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>> {
        let search = filter.search.as_deref().map(like_pattern);
        let users = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
              FROM users
             WHERE ($1::text IS NULL OR role = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL
                    OR lower(name) LIKE $3 ESCAPE '\'
                    OR lower(email) LIKE $3 ESCAPE '\')
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.role.map(|r| r.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(search)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.db)
        .await?;
        Ok(users)
    }

    async fn create(&self, user: NewUser) -> RepoResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, name, role, status, external_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(user.status.as_str())
        .bind(&user.external_id)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update(&self, id: Uuid, patch: UserPatch) -> RepoResult<Option<User>> {
        // Changing the password also retires any pending reset token.
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET email = COALESCE($2, email),
                   name = COALESCE($3, name),
                   role = COALESCE($4, role),
                   status = COALESCE($5, status),
                   external_id = COALESCE($6, external_id),
                   password_hash = COALESCE($7, password_hash),
                   reset_token = CASE WHEN $7 IS NULL THEN reset_token END,
                   reset_token_expiry = CASE WHEN $7 IS NULL THEN reset_token_expiry END
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&patch.email)
        .bind(&patch.name)
        .bind(patch.role.map(|r| r.as_str()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.external_id)
        .bind(&patch.password_hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "DELETE FROM users WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn touch_last_active(&self, id: Uuid, at: OffsetDateTime) -> RepoResult<()> {
        sqlx::query("UPDATE users SET last_active = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn set_avatar(&self, id: Uuid, key: Option<&str>) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET avatar = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token: &str,
        expiry: OffsetDateTime,
    ) -> RepoResult<()> {
        sqlx::query("UPDATE users SET reset_token = $2, reset_token_expiry = $3 WHERE id = $1")
            .bind(id)
            .bind(token)
            .bind(expiry)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn clear_reset_token(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query(
            "UPDATE users SET reset_token = NULL, reset_token_expiry = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        id: Uuid,
        token: &str,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> RepoResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE users
               SET password_hash = $3,
                   reset_token = NULL,
                   reset_token_expiry = NULL
             WHERE id = $1
               AND reset_token = $2
               AND reset_token_expiry > $4
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(password_hash)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(done.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_known_constraints_are_conflicts() {
        assert_eq!(conflict_field(Some("users_email_key")), Some("email"));
        assert_eq!(conflict_field(Some("users_external_id_key")), Some("externalId"));
        assert_eq!(conflict_field(Some("users_reset_token_idx")), None);
        assert_eq!(conflict_field(None), None);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Ana"), "%ana%");
        assert_eq!(like_pattern("50%_off"), r"%50\%\_off%");
        assert_eq!(like_pattern(r"a\b"), r"%a\\b%");
    }
}
