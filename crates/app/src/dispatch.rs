use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use classroom_core::{
    is_deliverable_device_token, DraftError, NotificationDraft, NotificationStatus,
    NotificationType, Page,
};
use classroom_push::{FcmClient, PushMessage};
use classroom_storage::{
    Database, DeliveryUpdate, NewNotification, NotificationError, NotificationRecord,
    UserNotificationRow,
};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::router::Clock;

const SCHEDULED_BATCH_LIMIT: i64 = 100;
const TTL_BATCH_LIMIT: i64 = 500;

/// Notification as returned to the sender after fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationView {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    pub data: Option<Value>,
    pub image_url: Option<String>,
    pub action_url: Option<String>,
    pub fcm_message_id: Option<String>,
    pub retry_count: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub recipient_count: usize,
}

impl NotificationView {
    fn new(record: NotificationRecord, recipient_count: usize) -> Self {
        let data = record.data();
        Self {
            id: record.id,
            kind: record.kind,
            title: record.title,
            body: record.body,
            status: record.status,
            data,
            image_url: record.image_url,
            action_url: record.action_url,
            fcm_message_id: record.fcm_message_id,
            retry_count: record.retry_count,
            scheduled_at: record.scheduled_at,
            expires_at: record.expires_at,
            created_at: record.created_at,
            recipient_count,
        }
    }
}

/// One entry of a user's inbox.
#[derive(Debug, Clone, Serialize)]
pub struct InboxItem {
    pub id: i64,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub data: Option<Value>,
    pub image_url: Option<String>,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<UserNotificationRow> for InboxItem {
    fn from(row: UserNotificationRow) -> Self {
        let data = row.data();
        Self {
            id: row.id,
            title: row.title,
            body: row.body,
            kind: row.kind,
            data,
            image_url: row.image_url,
            action_url: row.action_url,
            is_read: row.is_read,
            read_at: row.read_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxPage {
    pub notifications: Vec<InboxItem>,
    pub total: i64,
    pub unread_count: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationStats {
    pub total: i64,
    pub unread: i64,
    pub read: i64,
    pub by_type: BTreeMap<&'static str, i64>,
}

/// Result of one push attempt for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing was sent: push is disabled or no recipient has a usable device.
    Skipped,
    Delivered { message_id: Option<String> },
    Failed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidDraft(#[from] DraftError),
    #[error("at least one recipient is required")]
    NoRecipients,
    #[error("unknown recipients: {0:?}")]
    UnknownRecipients(Vec<i64>),
    #[error("notification not found")]
    NotFound,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persists notifications, fans them out to recipients and pushes them to devices.
#[derive(Clone)]
pub struct NotificationDispatcher {
    storage: Database,
    push: Option<FcmClient>,
    ttl: Duration,
    clock: Clock,
}

impl NotificationDispatcher {
    pub fn new(storage: Database, push: Option<FcmClient>, ttl: Duration, clock: Clock) -> Self {
        Self {
            storage,
            push,
            ttl,
            clock,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub async fn create_and_send(
        &self,
        user_id: i64,
        draft: &NotificationDraft,
    ) -> Result<NotificationView, DispatchError> {
        self.create_and_send_to_multiple(&[user_id], draft).await
    }

    /// Stores one notification with a recipient row per distinct user, then pushes it
    /// unless it is scheduled for later. Push problems are logged, never returned.
    pub async fn create_and_send_to_multiple(
        &self,
        user_ids: &[i64],
        draft: &NotificationDraft,
    ) -> Result<NotificationView, DispatchError> {
        draft.validate()?;

        let mut recipients = user_ids.to_vec();
        recipients.sort_unstable();
        recipients.dedup();
        if recipients.is_empty() {
            return Err(DispatchError::NoRecipients);
        }

        let existing = self.storage.users().existing_ids(&recipients).await?;
        if existing.len() != recipients.len() {
            let unknown = recipients
                .iter()
                .copied()
                .filter(|id| !existing.contains(id))
                .collect();
            return Err(DispatchError::UnknownRecipients(unknown));
        }

        let now = self.now();
        // Retention starts once the notification becomes visible.
        let visible_from = draft.scheduled_at.map_or(now, |at| at.max(now));
        let data_json = draft.data.as_ref().map(Value::to_string);
        let record = self
            .storage
            .notifications()
            .insert(
                &NewNotification {
                    kind: draft.kind,
                    title: draft.title.trim(),
                    body: &draft.body,
                    data_json,
                    image_url: draft.image_url.as_deref(),
                    action_url: draft.action_url.as_deref(),
                    scheduled_at: draft.scheduled_at,
                    expires_at: visible_from + self.ttl,
                    created_at: now,
                },
                &recipients,
            )
            .await
            .map_err(|err| match err {
                NotificationError::UnknownRecipient => DispatchError::UnknownRecipients(Vec::new()),
                NotificationError::Database(err) => DispatchError::Database(err),
            })?;

        counter!("notifications_created_total", "type" => draft.kind.as_str()).increment(1);
        counter!("notification_recipients_total").increment(recipients.len() as u64);
        info!(
            stage = "notify",
            notification_id = record.id,
            kind = draft.kind.as_str(),
            recipients = recipients.len(),
            "notification created"
        );

        if draft.is_deferred(now) {
            debug!(
                stage = "notify",
                notification_id = record.id,
                "delivery deferred until scheduled time"
            );
            return Ok(NotificationView::new(record, recipients.len()));
        }

        let id = record.id;
        self.deliver(&record, &recipients).await;
        let record = match self.storage.notifications().find_by_id(id).await? {
            Some(updated) => updated,
            None => record,
        };
        Ok(NotificationView::new(record, recipients.len()))
    }

    /// Fan-out for domain events. Failures are logged and never reach the caller.
    pub async fn notify_quietly(&self, user_ids: &[i64], draft: &NotificationDraft) {
        if user_ids.is_empty() {
            return;
        }
        if let Err(err) = self.create_and_send_to_multiple(user_ids, draft).await {
            warn!(
                stage = "notify",
                kind = draft.kind.as_str(),
                error = %err,
                "event notification failed"
            );
        }
    }

    /// Pushes a stored notification to every deliverable device of `recipients` and
    /// records the outcome on the notification row.
    pub async fn deliver(&self, record: &NotificationRecord, recipients: &[i64]) -> DeliveryOutcome {
        let now = self.now();
        let outcome = self.push_to_devices(record, recipients, now).await;

        let update = match &outcome {
            DeliveryOutcome::Delivered { message_id } => DeliveryUpdate {
                status: NotificationStatus::Delivered,
                fcm_message_id: message_id.as_deref(),
                increment_retry: false,
                attempted_at: now,
            },
            DeliveryOutcome::Failed => DeliveryUpdate {
                status: NotificationStatus::Failed,
                fcm_message_id: None,
                increment_retry: true,
                attempted_at: now,
            },
            DeliveryOutcome::Skipped => DeliveryUpdate {
                status: NotificationStatus::Sent,
                fcm_message_id: None,
                increment_retry: false,
                attempted_at: now,
            },
        };

        if let Err(err) = self
            .storage
            .notifications()
            .update_delivery(record.id, &update)
            .await
        {
            error!(
                stage = "notify",
                notification_id = record.id,
                error = %err,
                "failed to record delivery outcome"
            );
        }
        outcome
    }

    async fn push_to_devices(
        &self,
        record: &NotificationRecord,
        recipients: &[i64],
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let Some(push) = &self.push else {
            debug!(stage = "push", notification_id = record.id, "push disabled, skipping");
            counter!("push_delivery_total", "result" => "skipped").increment(1);
            return DeliveryOutcome::Skipped;
        };

        let tokens: Vec<String> = match self
            .storage
            .device_tokens()
            .tokens_for_users(recipients)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|row| row.token)
                .filter(|token| is_deliverable_device_token(token))
                .collect(),
            Err(err) => {
                error!(
                    stage = "push",
                    notification_id = record.id,
                    error = %err,
                    "failed to resolve device tokens"
                );
                counter!("push_delivery_total", "result" => "error").increment(1);
                return DeliveryOutcome::Failed;
            }
        };

        if tokens.is_empty() {
            debug!(stage = "push", notification_id = record.id, "no deliverable devices");
            counter!("push_delivery_total", "result" => "skipped").increment(1);
            return DeliveryOutcome::Skipped;
        }

        let mut message = PushMessage::new(record.title.clone(), record.body.clone())
            .with_entry("notification_id", record.id.to_string())
            .with_entry("type", record.kind.as_str());
        if let Some(data) = record.data() {
            message = message.with_data(&data);
        }
        if let Some(action_url) = &record.action_url {
            message = message.with_entry("action_url", action_url.clone());
        }
        message.image_url = record.image_url.clone();

        let report = match push.send_multicast(&message, &tokens, now).await {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    stage = "push",
                    notification_id = record.id,
                    error = %err,
                    "push send failed"
                );
                counter!("push_delivery_total", "result" => "error").increment(1);
                return DeliveryOutcome::Failed;
            }
        };

        let stale = report.unregistered_tokens();
        if !stale.is_empty() {
            match self.storage.device_tokens().delete_tokens(&stale).await {
                Ok(removed) => info!(
                    stage = "push",
                    removed,
                    "removed unregistered device tokens"
                ),
                Err(err) => error!(
                    stage = "push",
                    error = %err,
                    "failed to remove unregistered device tokens"
                ),
            }
        }

        info!(
            stage = "push",
            notification_id = record.id,
            success = report.success_count(),
            failure = report.failure_count(),
            "push attempt finished"
        );

        if report.success_count() > 0 {
            counter!("push_delivery_total", "result" => "delivered").increment(1);
            DeliveryOutcome::Delivered {
                message_id: report.first_message_id().map(str::to_string),
            }
        } else {
            counter!("push_delivery_total", "result" => "failed").increment(1);
            DeliveryOutcome::Failed
        }
    }

    pub async fn user_notifications(
        &self,
        user_id: i64,
        page: Page,
    ) -> Result<InboxPage, DispatchError> {
        let now = self.now();
        let repo = self.storage.notifications();
        let rows = repo
            .list_for_user(user_id, now, page.limit(), page.offset())
            .await?;
        let total = repo.count_for_user(user_id, now).await?;
        let unread_count = repo.count_unread(user_id, now).await?;

        Ok(InboxPage {
            notifications: rows.into_iter().map(InboxItem::from).collect(),
            total,
            unread_count,
            page: page.page,
            limit: page.limit,
            total_pages: page.total_pages(total),
        })
    }

    pub async fn stats(&self, user_id: i64) -> Result<NotificationStats, DispatchError> {
        let now = self.now();
        let repo = self.storage.notifications();
        let total = repo.count_for_user(user_id, now).await?;
        let unread = repo.count_unread(user_id, now).await?;
        let by_type = repo
            .stats_by_type(user_id, now)
            .await?
            .into_iter()
            .map(|row| (row.kind.as_str(), row.count))
            .collect();

        Ok(NotificationStats {
            total,
            unread,
            read: total - unread,
            by_type,
        })
    }

    pub async fn mark_as_read(&self, user_id: i64, notification_id: i64) -> Result<(), DispatchError> {
        let updated = self
            .storage
            .notifications()
            .mark_read(user_id, notification_id, self.now())
            .await?;
        if !updated {
            return Err(DispatchError::NotFound);
        }
        Ok(())
    }

    pub async fn mark_all_as_read(&self, user_id: i64) -> Result<u64, DispatchError> {
        Ok(self
            .storage
            .notifications()
            .mark_all_read(user_id, self.now())
            .await?)
    }

    /// Removes the notification from the caller's inbox only.
    pub async fn delete(&self, user_id: i64, notification_id: i64) -> Result<(), DispatchError> {
        let deleted = self
            .storage
            .notifications()
            .delete_recipient(user_id, notification_id)
            .await?;
        if !deleted {
            return Err(DispatchError::NotFound);
        }
        Ok(())
    }

    /// Deletes expired notifications in bounded batches until none remain.
    pub async fn cleanup_expired(&self) -> Result<u64, DispatchError> {
        let repo = self.storage.notifications();
        let now = self.now();
        let mut total = 0;
        loop {
            let deleted = repo.delete_expired_batch(now, TTL_BATCH_LIMIT).await?;
            total += deleted;
            if deleted < TTL_BATCH_LIMIT as u64 {
                break;
            }
        }
        Ok(total)
    }

    /// Pushes scheduled notifications whose time has come. Returns how many were attempted.
    pub async fn deliver_due_scheduled(&self) -> Result<usize, DispatchError> {
        let repo = self.storage.notifications();
        let due = repo.due_scheduled(self.now(), SCHEDULED_BATCH_LIMIT).await?;
        let mut attempted = 0;
        for record in due {
            let recipients = match repo.recipient_ids(record.id).await {
                Ok(recipients) => recipients,
                Err(err) => {
                    error!(
                        stage = "notify",
                        notification_id = record.id,
                        error = %err,
                        "failed to load scheduled notification recipients"
                    );
                    continue;
                }
            };
            let outcome = self.deliver(&record, &recipients).await;
            attempted += 1;
            debug!(
                stage = "notify",
                notification_id = record.id,
                outcome = ?outcome,
                "scheduled notification processed"
            );
        }
        Ok(attempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::setup_database;
    use classroom_core::Role;
    use classroom_push::TokenSource;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use url::Url;

    fn device_token(tag: &str) -> String {
        format!("{tag}-{}", "a".repeat(60))
    }

    fn fcm_client(server: &MockServer) -> FcmClient {
        FcmClient::new(
            "classroom",
            Url::parse(&server.url("/")).expect("url"),
            TokenSource::Static("static-token".into()),
            classroom_push::http_client(classroom_push::DEFAULT_REQUEST_TIMEOUT).expect("http client"),
        )
    }

    fn dispatcher(database: Database, push: Option<FcmClient>) -> NotificationDispatcher {
        NotificationDispatcher::new(database, push, Duration::days(30), Arc::new(Utc::now))
    }

    async fn user(database: &Database, email: &str) -> i64 {
        let role = database
            .roles()
            .find_by_name(Role::Student)
            .await
            .unwrap()
            .unwrap();
        database
            .users()
            .insert(&classroom_storage::NewUser {
                name: email,
                email,
                password_hash: "hash",
                role_id: role.id,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .id
    }

    fn draft() -> NotificationDraft {
        NotificationDraft::new(NotificationType::Announcement, "Exam moved", "Now on Friday")
            .with_data(json!({ "room": "B12" }))
    }

    #[tokio::test]
    async fn fan_out_creates_one_row_per_distinct_recipient() {
        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let b = user(&database, "b@example.com").await;
        let dispatcher = dispatcher(database.clone(), None);

        let view = dispatcher
            .create_and_send_to_multiple(&[a, b, a], &draft())
            .await
            .expect("send");
        assert_eq!(view.recipient_count, 2);
        assert_eq!(view.status, NotificationStatus::Sent);
        assert_eq!(view.data, Some(json!({ "room": "B12" })));
        let ttl = view.expires_at.unwrap() - view.created_at;
        assert_eq!(ttl.num_days(), 30);

        let recipients = database.notifications().recipient_ids(view.id).await.unwrap();
        assert_eq!(recipients, vec![a, b]);

        let inbox = dispatcher.user_notifications(a, Page::new(None, None, 20)).await.unwrap();
        assert_eq!(inbox.total, 1);
        assert_eq!(inbox.unread_count, 1);
        assert_eq!(inbox.notifications[0].title, "Exam moved");
        assert!(!inbox.notifications[0].is_read);
    }

    #[tokio::test]
    async fn rejects_bad_recipient_lists_before_writing() {
        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let dispatcher = dispatcher(database.clone(), None);

        let err = dispatcher
            .create_and_send_to_multiple(&[], &draft())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoRecipients));

        let err = dispatcher
            .create_and_send_to_multiple(&[a, 999], &draft())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownRecipients(ref ids) if ids == &vec![999]));

        let mut invalid = draft();
        invalid.title = String::new();
        let err = dispatcher.create_and_send(a, &invalid).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidDraft(DraftError::EmptyTitle)));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn successful_push_marks_delivered_and_prunes_stale_tokens() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/classroom/messages:send")
                    .body_contains("good-");
                then.status(200)
                    .json_body(json!({ "name": "projects/classroom/messages/1" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/projects/classroom/messages:send")
                    .body_contains("stale-");
                then.status(404).json_body(json!({
                    "error": {
                        "status": "NOT_FOUND",
                        "message": "Requested entity was not found.",
                        "details": [{ "errorCode": "UNREGISTERED" }]
                    }
                }));
            })
            .await;

        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let b = user(&database, "b@example.com").await;
        let c = user(&database, "c@example.com").await;
        let now = Utc::now();
        let devices = database.device_tokens();
        devices.register(a, &device_token("good"), now).await.unwrap();
        devices.register(b, &device_token("stale"), now).await.unwrap();
        devices.register(c, "mock-token-1", now).await.unwrap();

        let dispatcher = dispatcher(database.clone(), Some(fcm_client(&server)));
        let view = dispatcher
            .create_and_send_to_multiple(&[a, b, c], &draft())
            .await
            .expect("send");

        accepted.assert_hits_async(1).await;
        assert_eq!(view.status, NotificationStatus::Delivered);
        assert_eq!(
            view.fcm_message_id.as_deref(),
            Some("projects/classroom/messages/1")
        );
        assert_eq!(view.retry_count, 0);
        assert!(devices.list_for_user(b).await.unwrap().is_empty());
        assert_eq!(devices.list_for_user(c).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_push_marks_failed_without_failing_request() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/projects/classroom/messages:send");
                then.status(500).body("unavailable");
            })
            .await;

        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        database
            .device_tokens()
            .register(a, &device_token("device"), Utc::now())
            .await
            .unwrap();

        let dispatcher = dispatcher(database, Some(fcm_client(&server)));
        let view = dispatcher.create_and_send(a, &draft()).await.expect("send");
        assert_eq!(view.status, NotificationStatus::Failed);
        assert_eq!(view.retry_count, 1);
        assert_eq!(view.fcm_message_id, None);
    }

    #[tokio::test]
    async fn recipients_without_devices_stay_sent() {
        let server = MockServer::start_async().await;
        let endpoint = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/projects/classroom/messages:send");
                then.status(200).json_body(json!({ "name": "unused" }));
            })
            .await;

        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let dispatcher = dispatcher(database, Some(fcm_client(&server)));

        let view = dispatcher.create_and_send(a, &draft()).await.expect("send");
        assert_eq!(view.status, NotificationStatus::Sent);
        endpoint.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn scheduled_notifications_wait_for_due_time() {
        let server = MockServer::start_async().await;
        let endpoint = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/projects/classroom/messages:send");
                then.status(200)
                    .json_body(json!({ "name": "projects/classroom/messages/9" }));
            })
            .await;

        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let start = Utc::now();
        database
            .device_tokens()
            .register(a, &device_token("device"), start)
            .await
            .unwrap();

        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        let dispatcher = dispatcher(database, Some(fcm_client(&server))).with_clock(clock);

        let mut scheduled = draft();
        scheduled.scheduled_at = Some(start + Duration::hours(1));
        let view = dispatcher.create_and_send(a, &scheduled).await.expect("send");
        assert_eq!(view.status, NotificationStatus::Sent);
        endpoint.assert_hits_async(0).await;

        let inbox = dispatcher.user_notifications(a, Page::new(None, None, 20)).await.unwrap();
        assert_eq!(inbox.total, 0);
        assert_eq!(dispatcher.deliver_due_scheduled().await.unwrap(), 0);

        *now.lock().unwrap() = start + Duration::hours(2);
        assert_eq!(dispatcher.deliver_due_scheduled().await.unwrap(), 1);
        endpoint.assert_hits_async(1).await;
        assert_eq!(dispatcher.deliver_due_scheduled().await.unwrap(), 0);

        let inbox = dispatcher.user_notifications(a, Page::new(None, None, 20)).await.unwrap();
        assert_eq!(inbox.total, 1);
    }

    #[tokio::test]
    async fn scheduled_batch_survives_unreadable_recipients() {
        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let start = Utc::now();
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        let dispatcher = dispatcher(database.clone(), None).with_clock(clock);

        for minutes in [5, 10] {
            let mut scheduled = draft();
            scheduled.scheduled_at = Some(start + Duration::minutes(minutes));
            dispatcher.create_and_send(a, &scheduled).await.expect("schedule");
        }
        sqlx::query("ALTER TABLE notification_recipients RENAME TO recipients_offline")
            .execute(database.pool())
            .await
            .unwrap();

        *now.lock().unwrap() = start + Duration::minutes(15);
        assert_eq!(dispatcher.deliver_due_scheduled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_state_and_deletion_are_per_recipient() {
        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let b = user(&database, "b@example.com").await;
        let dispatcher = dispatcher(database, None);

        let first = dispatcher
            .create_and_send_to_multiple(&[a, b], &draft())
            .await
            .unwrap();
        dispatcher
            .create_and_send(
                a,
                &NotificationDraft::new(NotificationType::LessonCreated, "New lesson", "Algebra"),
            )
            .await
            .unwrap();

        dispatcher.mark_as_read(a, first.id).await.unwrap();
        dispatcher.mark_as_read(a, first.id).await.unwrap();
        let err = dispatcher.mark_as_read(a, 9999).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));

        let stats = dispatcher.stats(a).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unread, 1);
        assert_eq!(stats.read, 1);
        assert_eq!(stats.by_type.get("announcement"), Some(&1));
        assert_eq!(stats.by_type.get("lesson_created"), Some(&1));

        assert_eq!(dispatcher.stats(b).await.unwrap().unread, 1);

        dispatcher.delete(b, first.id).await.unwrap();
        let err = dispatcher.delete(b, first.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));
        assert_eq!(dispatcher.stats(b).await.unwrap().total, 0);
        assert_eq!(dispatcher.stats(a).await.unwrap().total, 2);

        assert_eq!(dispatcher.mark_all_as_read(a).await.unwrap(), 1);
        assert_eq!(dispatcher.stats(a).await.unwrap().unread, 0);
    }

    #[tokio::test]
    async fn expired_notifications_are_cleaned_up() {
        let database = setup_database().await;
        let a = user(&database, "a@example.com").await;
        let start = Utc::now();
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        let dispatcher = dispatcher(database, None).with_clock(clock);

        dispatcher.create_and_send(a, &draft()).await.unwrap();
        assert_eq!(dispatcher.cleanup_expired().await.unwrap(), 0);

        *now.lock().unwrap() = start + Duration::days(31);
        assert_eq!(dispatcher.cleanup_expired().await.unwrap(), 1);
        assert_eq!(dispatcher.stats(a).await.unwrap().total, 0);
    }
}
