use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use crate::{is_foreign_key_violation, is_unique_violation, to_rfc3339};

/// Repository for refresh tokens. Each row is one login session.
#[derive(Clone)]
pub struct RefreshTokenRepository {
    pool: SqlitePool,
}

/// Stored session. The token itself is never persisted, only its digest.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub token_digest: String,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub device_info: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Payload required to insert a refresh token.
pub struct NewRefreshToken<'a> {
    pub user_id: i64,
    pub token_digest: &'a str,
    pub expires_at: DateTime<Utc>,
    pub device_info: &'a str,
    pub ip_address: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while inserting refresh tokens.
#[derive(Debug, Error)]
pub enum RefreshTokenError {
    #[error("refresh token digest already exists")]
    DuplicateDigest,
    #[error("user does not exist")]
    MissingUser,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const TOKEN_COLUMNS: &str = "id, user_id, token_digest, expires_at, is_revoked, device_info, \
                             ip_address, created_at, updated_at, last_used_at";

impl RefreshTokenRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begins a SQLite transaction.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        token: &NewRefreshToken<'_>,
    ) -> Result<RefreshTokenRecord, RefreshTokenError> {
        let created_at = to_rfc3339(token.created_at);
        sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "INSERT INTO refresh_tokens \
             (user_id, token_digest, expires_at, is_revoked, device_info, ip_address, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?) \
             RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(token.user_id)
        .bind(token.token_digest)
        .bind(to_rfc3339(token.expires_at))
        .bind(token.device_info)
        .bind(token.ip_address)
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RefreshTokenError::DuplicateDigest
            } else if is_foreign_key_violation(&err) {
                RefreshTokenError::MissingUser
            } else {
                RefreshTokenError::Database(err)
            }
        })
    }

    pub async fn find_by_digest(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        digest: &str,
    ) -> Result<Option<RefreshTokenRecord>, sqlx::Error> {
        sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_digest = ?"
        ))
        .bind(digest)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn touch_last_used(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let at = to_rfc3339(at);
        sqlx::query("UPDATE refresh_tokens SET last_used_at = ?, updated_at = ? WHERE id = ?")
            .bind(&at)
            .bind(&at)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Revokes one session of `user_id`. Returns `false` when the session belongs to
    /// somebody else or does not exist.
    pub async fn revoke(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = 1, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(to_rfc3339(at))
        .bind(id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Revokes the live tokens issued to `device_info` for the user.
    pub async fn revoke_for_device(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        device_info: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = 1, updated_at = ? \
             WHERE user_id = ? AND device_info = ? AND is_revoked = 0",
        )
        .bind(to_rfc3339(at))
        .bind(user_id)
        .bind(device_info)
        .execute(&mut **tx)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn revoke_by_digest(
        &self,
        digest: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = 1, updated_at = ? \
             WHERE token_digest = ? AND is_revoked = 0",
        )
        .bind(to_rfc3339(at))
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = 1, updated_at = ? \
             WHERE user_id = ? AND is_revoked = 0",
        )
        .bind(to_rfc3339(at))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Non-revoked, unexpired sessions, newest first.
    pub async fn list_active_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshTokenRecord>, sqlx::Error> {
        sqlx::query_as::<_, RefreshTokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens \
             WHERE user_id = ? AND is_revoked = 0 AND expires_at > ? \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await
    }

    /// Deletes up to `limit` tokens whose expiry lies before `now`, revoked or not.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "DELETE FROM refresh_tokens WHERE id IN ( \
                 SELECT id FROM refresh_tokens WHERE expires_at < ? ORDER BY id LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}
