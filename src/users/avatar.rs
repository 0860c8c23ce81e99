use anyhow::Context;
use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use super::{model::User, repo::UserRepository};
use crate::{
    error::{AppError, AppResult},
    storage::StorageClient,
};

pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;
const PRESIGN_TTL_SECS: u64 = 10 * 60;

pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn avatar_key(user_id: Uuid, ext: &str) -> String {
    format!("avatars/{}/{}.{}", user_id, Uuid::new_v4(), ext)
}

/// Stores a new avatar object, points the user at it, then drops the
/// previous object.
pub async fn replace_avatar(
    storage: &dyn StorageClient,
    users: &dyn UserRepository,
    user: &User,
    body: Bytes,
    content_type: &str,
) -> AppResult<User> {
    let ext = ext_from_mime(content_type)
        .ok_or_else(|| AppError::field("avatar", "Only JPEG, PNG or WebP images are accepted"))?;
    if body.is_empty() {
        return Err(AppError::field("avatar", "File is empty"));
    }
    if body.len() > MAX_AVATAR_BYTES {
        return Err(AppError::field("avatar", "File is larger than 5 MB"));
    }

    let key = avatar_key(user.id, ext);
    storage
        .put_object(&key, body, content_type)
        .await
        .context("upload avatar")?;

    let Some(updated) = users.set_avatar(user.id, Some(&key)).await? else {
        // User vanished mid-upload.
        remove_object(storage, &key).await;
        return Err(AppError::NotFound("User not found"));
    };
    if let Some(old) = &user.avatar {
        remove_object(storage, old).await;
    }
    info!(user_id = %user.id, %key, "avatar replaced");
    Ok(updated)
}

/// Best-effort cleanup; failures are only logged.
pub async fn remove_object(storage: &dyn StorageClient, key: &str) {
    if let Err(e) = storage.delete_object(key).await {
        warn!(error = %e, %key, "avatar object delete failed");
    }
}

pub async fn presign(storage: &dyn StorageClient, key: &str) -> anyhow::Result<String> {
    storage
        .presign_get(key, PRESIGN_TTL_SECS)
        .await
        .with_context(|| format!("presign avatar {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeStorage, MemoryUserRepository};

    #[test]
    fn test_ext_from_mime() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/jpg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("image/gif"), None);
        assert_eq!(ext_from_mime("application/octet-stream"), None);
    }

    #[tokio::test]
    async fn replace_stores_new_and_drops_old_object() {
        let storage = FakeStorage::default();
        let users = MemoryUserRepository::default();
        let user = testing::seed_user(&users, "a@b.com", "secret1").await;

        let first = replace_avatar(&storage, &users, &user, Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        let first_key = first.avatar.clone().unwrap();
        assert!(first_key.starts_with(&format!("avatars/{}/", user.id)));
        assert!(first_key.ends_with(".png"));

        let second = replace_avatar(&storage, &users, &first, Bytes::from_static(b"jpg"), "image/jpeg")
            .await
            .unwrap();
        let keys = storage.keys().await;
        assert_eq!(keys, vec![second.avatar.unwrap()]);
    }

    #[tokio::test]
    async fn rejects_unsupported_type_and_oversize() {
        let storage = FakeStorage::default();
        let users = MemoryUserRepository::default();
        let user = testing::seed_user(&users, "a@b.com", "secret1").await;

        let err = replace_avatar(&storage, &users, &user, Bytes::from_static(b"gif"), "image/gif")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let big = Bytes::from(vec![0u8; MAX_AVATAR_BYTES + 1]);
        let err = replace_avatar(&storage, &users, &user, big, "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn presign_points_at_key() {
        let storage = FakeStorage::default();
        let url = presign(&storage, "avatars/x/y.png").await.unwrap();
        assert!(url.contains("avatars/x/y.png"));
    }
}
