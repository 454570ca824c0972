use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_foreign_key_violation, placeholders, to_rfc3339};

/// Repository for push device registrations.
#[derive(Clone)]
pub struct DeviceTokenRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeviceTokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Token resolved for push delivery.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserDeviceToken {
    pub user_id: i64,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum DeviceTokenError {
    #[error("user does not exist")]
    MissingUser,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DeviceTokenRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Makes `token` the only registered device of `user_id`.
    ///
    /// Re-registering the same pair is a no-op. Otherwise the user's previous tokens
    /// are dropped, and a token that belonged to another account is moved over.
    pub async fn register(
        &self,
        user_id: i64,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceTokenRecord, DeviceTokenError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, DeviceTokenRecord>(
            "SELECT id, user_id, token, created_at FROM device_tokens WHERE user_id = ? AND token = ?",
        )
        .bind(user_id)
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(record) = existing {
            tx.commit().await?;
            return Ok(record);
        }

        sqlx::query("DELETE FROM device_tokens WHERE user_id = ? OR token = ?")
            .bind(user_id)
            .bind(token)
            .execute(&mut *tx)
            .await?;

        let record = sqlx::query_as::<_, DeviceTokenRecord>(
            "INSERT INTO device_tokens (user_id, token, created_at) VALUES (?, ?, ?) \
             RETURNING id, user_id, token, created_at",
        )
        .bind(user_id)
        .bind(token)
        .bind(to_rfc3339(now))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                DeviceTokenError::MissingUser
            } else {
                DeviceTokenError::Database(err)
            }
        })?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<DeviceTokenRecord>, sqlx::Error> {
        sqlx::query_as::<_, DeviceTokenRecord>(
            "SELECT id, user_id, token, created_at FROM device_tokens WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Resolves the device tokens registered by any of `user_ids`.
    pub async fn tokens_for_users(
        &self,
        user_ids: &[i64],
    ) -> Result<Vec<UserDeviceToken>, sqlx::Error> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT user_id, token FROM device_tokens WHERE user_id IN ({}) ORDER BY user_id, id",
            placeholders(user_ids.len())
        );
        let mut query = sqlx::query_as::<_, UserDeviceToken>(&sql);
        for id in user_ids {
            query = query.bind(id);
        }
        query.fetch_all(&self.pool).await
    }

    /// Deletes tokens the push provider no longer accepts.
    pub async fn delete_tokens(&self, tokens: &[String]) -> Result<u64, sqlx::Error> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM device_tokens WHERE token IN ({})",
            placeholders(tokens.len())
        );
        let mut query = sqlx::query(&sql);
        for token in tokens {
            query = query.bind(token);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_user, setup_db};
    use classroom_core::Role;

    #[tokio::test]
    async fn register_keeps_single_token_per_user() {
        let db = setup_db().await;
        let user = insert_user(&db, "s@example.com", Role::Student).await;
        let repo = db.device_tokens();
        let now = Utc::now();

        let first = repo.register(user.id, "token-a", now).await.unwrap();
        let again = repo.register(user.id, "token-a", now).await.unwrap();
        assert_eq!(first, again);

        repo.register(user.id, "token-b", now).await.unwrap();
        let tokens = repo.list_for_user(user.id).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, "token-b");
    }

    #[tokio::test]
    async fn register_moves_token_between_users() {
        let db = setup_db().await;
        let alice = insert_user(&db, "alice@example.com", Role::Student).await;
        let bob = insert_user(&db, "bob@example.com", Role::Student).await;
        let repo = db.device_tokens();
        let now = Utc::now();

        repo.register(alice.id, "shared", now).await.unwrap();
        repo.register(bob.id, "shared", now).await.unwrap();

        assert!(repo.list_for_user(alice.id).await.unwrap().is_empty());
        let resolved = repo.tokens_for_users(&[alice.id, bob.id]).await.unwrap();
        assert_eq!(
            resolved,
            vec![UserDeviceToken {
                user_id: bob.id,
                token: "shared".into()
            }]
        );
    }

    #[tokio::test]
    async fn register_requires_existing_user() {
        let db = setup_db().await;
        let err = db
            .device_tokens()
            .register(77, "token", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceTokenError::MissingUser));
    }

    #[tokio::test]
    async fn delete_tokens_prunes_given_values() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let b = insert_user(&db, "b@example.com", Role::Student).await;
        let repo = db.device_tokens();
        let now = Utc::now();
        repo.register(a.id, "ta", now).await.unwrap();
        repo.register(b.id, "tb", now).await.unwrap();

        let deleted = repo
            .delete_tokens(&["ta".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.tokens_for_users(&[a.id, b.id]).await.unwrap().len(), 1);
        assert_eq!(repo.delete_tokens(&[]).await.unwrap(), 0);
    }
}
