use chrono::{DateTime, Utc};
use classroom_core::{NotificationStatus, NotificationType};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_foreign_key_violation, to_rfc3339};

/// Repository for notifications and their per-user recipient rows.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: i64,
    #[sqlx(rename = "type", try_from = "String")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    #[sqlx(try_from = "String")]
    pub status: NotificationStatus,
    pub data_json: Option<String>,
    pub image_url: Option<String>,
    pub action_url: Option<String>,
    pub fcm_message_id: Option<String>,
    pub retry_count: i64,
    pub delivery_attempted_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Decodes the stored data payload. Corrupt JSON is treated as absent.
    pub fn data(&self) -> Option<Value> {
        self.data_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// A notification as seen from one recipient's inbox.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserNotificationRow {
    pub id: i64,
    #[sqlx(rename = "type", try_from = "String")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub data_json: Option<String>,
    pub image_url: Option<String>,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserNotificationRow {
    pub fn data(&self) -> Option<Value> {
        self.data_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TypeCount {
    #[sqlx(rename = "type", try_from = "String")]
    pub kind: NotificationType,
    pub count: i64,
}

/// Parameters required to insert a notification.
pub struct NewNotification<'a> {
    pub kind: NotificationType,
    pub title: &'a str,
    pub body: &'a str,
    pub data_json: Option<String>,
    pub image_url: Option<&'a str>,
    pub action_url: Option<&'a str>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one push attempt.
pub struct DeliveryUpdate<'a> {
    pub status: NotificationStatus,
    pub fcm_message_id: Option<&'a str>,
    pub increment_retry: bool,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification recipient does not exist")]
    UnknownRecipient,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const NOTIFICATION_COLUMNS: &str = "id, type, title, body, status, data_json, image_url, \
     action_url, fcm_message_id, retry_count, delivery_attempted_at, scheduled_at, expires_at, \
     created_at, updated_at";

// Scheduled notifications stay out of inboxes until they are due.
const VISIBLE: &str = "(n.scheduled_at IS NULL OR n.scheduled_at <= ?)";

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the notification and one unread recipient row per user atomically.
    pub async fn insert(
        &self,
        notification: &NewNotification<'_>,
        recipients: &[i64],
    ) -> Result<NotificationRecord, NotificationError> {
        let created_at = to_rfc3339(notification.created_at);
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, NotificationRecord>(&format!(
            "INSERT INTO notifications \
             (type, title, body, status, data_json, image_url, action_url, retry_count, \
              scheduled_at, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?) \
             RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(notification.kind.as_str())
        .bind(notification.title)
        .bind(notification.body)
        .bind(NotificationStatus::Sent.as_str())
        .bind(&notification.data_json)
        .bind(notification.image_url)
        .bind(notification.action_url)
        .bind(notification.scheduled_at.map(to_rfc3339))
        .bind(to_rfc3339(notification.expires_at))
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&mut *tx)
        .await?;

        for user_id in recipients {
            sqlx::query(
                "INSERT INTO notification_recipients \
                 (user_id, notification_id, is_read, created_at, updated_at) \
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(user_id)
            .bind(record.id)
            .bind(&created_at)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    NotificationError::UnknownRecipient
                } else {
                    NotificationError::Database(err)
                }
            })?;
        }

        tx.commit().await?;
        Ok(record)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<NotificationRecord>, sqlx::Error> {
        sqlx::query_as::<_, NotificationRecord>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn recipient_ids(&self, notification_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM notification_recipients WHERE notification_id = ? ORDER BY user_id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Records the outcome of a push attempt.
    pub async fn update_delivery(
        &self,
        id: i64,
        update: &DeliveryUpdate<'_>,
    ) -> Result<(), sqlx::Error> {
        let attempted_at = to_rfc3339(update.attempted_at);
        sqlx::query(
            "UPDATE notifications \
             SET status = ?, \
                 fcm_message_id = COALESCE(?, fcm_message_id), \
                 retry_count = retry_count + ?, \
                 delivery_attempted_at = ?, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(update.fcm_message_id)
        .bind(i64::from(update.increment_retry))
        .bind(&attempted_at)
        .bind(&attempted_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pages through the user's inbox, newest first.
    pub async fn list_for_user(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<UserNotificationRow>, sqlx::Error> {
        sqlx::query_as::<_, UserNotificationRow>(&format!(
            "SELECT n.id, n.type, n.title, n.body, n.data_json, n.image_url, n.action_url, \
                    r.is_read, r.read_at, n.created_at \
               FROM notification_recipients AS r \
               JOIN notifications AS n ON n.id = r.notification_id \
              WHERE r.user_id = ? AND {VISIBLE} \
              ORDER BY n.created_at DESC, n.id DESC \
              LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(to_rfc3339(now))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count_for_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM notification_recipients AS r \
               JOIN notifications AS n ON n.id = r.notification_id \
              WHERE r.user_id = ? AND {VISIBLE}"
        ))
        .bind(user_id)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await
    }

    pub async fn count_unread(&self, user_id: i64, now: DateTime<Utc>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM notification_recipients AS r \
               JOIN notifications AS n ON n.id = r.notification_id \
              WHERE r.user_id = ? AND r.is_read = 0 AND {VISIBLE}"
        ))
        .bind(user_id)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await
    }

    pub async fn stats_by_type(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TypeCount>, sqlx::Error> {
        sqlx::query_as::<_, TypeCount>(&format!(
            "SELECT n.type, COUNT(*) AS count FROM notification_recipients AS r \
               JOIN notifications AS n ON n.id = r.notification_id \
              WHERE r.user_id = ? AND {VISIBLE} \
              GROUP BY n.type ORDER BY n.type"
        ))
        .bind(user_id)
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await
    }

    /// Marks one inbox entry read, keeping the first `read_at`.
    /// Returns `false` when the user is not a recipient.
    pub async fn mark_read(
        &self,
        user_id: i64,
        notification_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let at = to_rfc3339(at);
        let done = sqlx::query(
            "UPDATE notification_recipients \
             SET is_read = 1, read_at = COALESCE(read_at, ?), updated_at = ? \
             WHERE user_id = ? AND notification_id = ?",
        )
        .bind(&at)
        .bind(&at)
        .bind(user_id)
        .bind(notification_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn mark_all_read(&self, user_id: i64, at: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let at = to_rfc3339(at);
        let done = sqlx::query(
            "UPDATE notification_recipients SET is_read = 1, read_at = ?, updated_at = ? \
             WHERE user_id = ? AND is_read = 0",
        )
        .bind(&at)
        .bind(&at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Removes the notification from one user's inbox only.
    pub async fn delete_recipient(
        &self,
        user_id: i64,
        notification_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            "DELETE FROM notification_recipients WHERE user_id = ? AND notification_id = ?",
        )
        .bind(user_id)
        .bind(notification_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Deletes up to `limit` notifications past their expiry; recipient rows cascade.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let done = sqlx::query(
            "DELETE FROM notifications WHERE id IN ( \
                 SELECT id FROM notifications \
                  WHERE expires_at IS NOT NULL AND expires_at < ? \
                  ORDER BY id LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Scheduled notifications that are due and were never pushed.
    pub async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, sqlx::Error> {
        sqlx::query_as::<_, NotificationRecord>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
              WHERE status = ? \
                AND scheduled_at IS NOT NULL \
                AND scheduled_at <= ? \
                AND delivery_attempted_at IS NULL \
              ORDER BY scheduled_at ASC, id ASC \
              LIMIT ?"
        ))
        .bind(NotificationStatus::Sent.as_str())
        .bind(to_rfc3339(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_user, setup_db};
    use chrono::Duration;
    use classroom_core::Role;
    use serde_json::json;

    fn draft<'a>(title: &'a str, now: DateTime<Utc>) -> NewNotification<'a> {
        NewNotification {
            kind: NotificationType::Announcement,
            title,
            body: "body",
            data_json: Some(json!({ "lesson": 1 }).to_string()),
            image_url: None,
            action_url: None,
            scheduled_at: None,
            expires_at: now + Duration::days(30),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn insert_fans_out_to_recipients() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let b = insert_user(&db, "b@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();

        let record = repo.insert(&draft("Hello", now), &[a.id, b.id]).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Sent);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.data(), Some(json!({ "lesson": 1 })));
        assert_eq!(repo.recipient_ids(record.id).await.unwrap(), vec![a.id, b.id]);

        let inbox = repo.list_for_user(a.id, now, 20, 0).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(!inbox[0].is_read);
        assert_eq!(repo.count_unread(b.id, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_with_unknown_recipient_rolls_back() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();

        let err = repo.insert(&draft("Hello", now), &[a.id, 9_999]).await.unwrap_err();
        assert!(matches!(err, NotificationError::UnknownRecipient));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn read_state_is_per_recipient_and_idempotent() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let b = insert_user(&db, "b@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();
        let first = repo.insert(&draft("One", now), &[a.id, b.id]).await.unwrap();
        repo.insert(&draft("Two", now + Duration::seconds(1)), &[a.id])
            .await
            .unwrap();
        let later = now + Duration::minutes(5);

        assert!(repo.mark_read(a.id, first.id, later).await.unwrap());
        assert!(repo
            .mark_read(a.id, first.id, later + Duration::minutes(1))
            .await
            .unwrap());
        let inbox = repo.list_for_user(a.id, later, 20, 0).await.unwrap();
        assert_eq!(inbox[0].title, "Two");
        let read = inbox.iter().find(|row| row.id == first.id).unwrap();
        assert!(read.is_read);
        assert_eq!(read.read_at.map(to_rfc3339), Some(to_rfc3339(later)));

        assert_eq!(repo.count_unread(a.id, later).await.unwrap(), 1);
        assert_eq!(repo.count_unread(b.id, later).await.unwrap(), 1);

        assert_eq!(repo.mark_all_read(a.id, later).await.unwrap(), 1);
        assert_eq!(repo.count_unread(a.id, later).await.unwrap(), 0);

        let outsider = insert_user(&db, "c@example.com", Role::Student).await;
        assert!(!repo.mark_read(outsider.id, first.id, later).await.unwrap());
    }

    #[tokio::test]
    async fn delete_recipient_only_affects_caller() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let b = insert_user(&db, "b@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();
        let record = repo.insert(&draft("One", now), &[a.id, b.id]).await.unwrap();

        assert!(repo.delete_recipient(a.id, record.id).await.unwrap());
        assert!(!repo.delete_recipient(a.id, record.id).await.unwrap());
        assert_eq!(repo.count_for_user(a.id, now).await.unwrap(), 0);
        assert_eq!(repo.count_for_user(b.id, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_group_by_type() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();
        repo.insert(&draft("One", now), &[a.id]).await.unwrap();
        repo.insert(&draft("Two", now), &[a.id]).await.unwrap();
        let mut system = draft("Three", now);
        system.kind = NotificationType::System;
        repo.insert(&system, &[a.id]).await.unwrap();

        let stats = repo.stats_by_type(a.id, now).await.unwrap();
        assert_eq!(
            stats,
            vec![
                TypeCount {
                    kind: NotificationType::Announcement,
                    count: 2
                },
                TypeCount {
                    kind: NotificationType::System,
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn delivery_update_and_expiry_cleanup() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();
        let record = repo.insert(&draft("One", now), &[a.id]).await.unwrap();

        repo.update_delivery(
            record.id,
            &DeliveryUpdate {
                status: NotificationStatus::Failed,
                fcm_message_id: None,
                increment_retry: true,
                attempted_at: now,
            },
        )
        .await
        .unwrap();
        repo.update_delivery(
            record.id,
            &DeliveryUpdate {
                status: NotificationStatus::Delivered,
                fcm_message_id: Some("projects/p/messages/1"),
                increment_retry: false,
                attempted_at: now,
            },
        )
        .await
        .unwrap();
        let stored = repo.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Delivered);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.fcm_message_id.as_deref(), Some("projects/p/messages/1"));

        assert_eq!(repo.delete_expired_batch(now + Duration::days(29), 100).await.unwrap(), 0);
        assert_eq!(repo.delete_expired_batch(now + Duration::days(31), 100).await.unwrap(), 1);
        assert_eq!(repo.count_for_user(a.id, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scheduled_notifications_wait_until_due() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let repo = db.notifications();
        let now = Utc::now();
        let mut scheduled = draft("Later", now);
        scheduled.scheduled_at = Some(now + Duration::hours(1));
        let record = repo.insert(&scheduled, &[a.id]).await.unwrap();

        assert!(repo.due_scheduled(now, 10).await.unwrap().is_empty());
        assert_eq!(repo.count_for_user(a.id, now).await.unwrap(), 0);

        let due_at = now + Duration::hours(2);
        let due = repo.due_scheduled(due_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, record.id);
        assert_eq!(repo.count_for_user(a.id, due_at).await.unwrap(), 1);

        repo.update_delivery(
            record.id,
            &DeliveryUpdate {
                status: NotificationStatus::Sent,
                fcm_message_id: None,
                increment_retry: false,
                attempted_at: due_at,
            },
        )
        .await
        .unwrap();
        assert!(repo.due_scheduled(due_at, 10).await.unwrap().is_empty());
    }
}
