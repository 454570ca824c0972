use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Account role. Self-registration always yields [`Role::Student`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    #[default]
    Student,
}

impl Role {
    /// Roles inserted on first startup.
    pub const DEFAULTS: [Role; 2] = [Role::Teacher, Role::Student];

    /// Returns the canonical database representation for the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "teacher" => Ok(Self::Teacher),
            "student" => Ok(Self::Student),
            other => Err(UnknownVariant::new("role", other)),
        }
    }
}

/// Category of a notification, used for client routing and per-type stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    HomeworkAssigned,
    HomeworkDue,
    HomeworkGraded,
    LessonCreated,
    GroupInvite,
    Announcement,
    #[default]
    System,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HomeworkAssigned => "homework_assigned",
            Self::HomeworkDue => "homework_due",
            Self::HomeworkGraded => "homework_graded",
            Self::LessonCreated => "lesson_created",
            Self::GroupInvite => "group_invite",
            Self::Announcement => "announcement",
            Self::System => "system",
        }
    }
}

impl FromStr for NotificationType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "homework_assigned" => Ok(Self::HomeworkAssigned),
            "homework_due" => Ok(Self::HomeworkDue),
            "homework_graded" => Ok(Self::HomeworkGraded),
            "lesson_created" => Ok(Self::LessonCreated),
            "group_invite" => Ok(Self::GroupInvite),
            "announcement" => Ok(Self::Announcement),
            "system" => Ok(Self::System),
            other => Err(UnknownVariant::new("notification type", other)),
        }
    }
}

/// Delivery state of a notification as a whole (not per recipient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for NotificationStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("notification status", other)),
        }
    }
}

/// Lifecycle of one student's copy of a homework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HomeworkStatus {
    #[default]
    Pending,
    Submitted,
    Graded,
    Late,
}

impl HomeworkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Graded => "graded",
            Self::Late => "late",
        }
    }
}

impl FromStr for HomeworkStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "graded" => Ok(Self::Graded),
            "late" => Ok(Self::Late),
            other => Err(UnknownVariant::new("homework status", other)),
        }
    }
}

macro_rules! try_from_string {
    ($($ty:ty),+) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = UnknownVariant;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )+
    };
}

try_from_string!(Role, NotificationType, NotificationStatus, HomeworkStatus);

/// Returned when a persisted enum column holds an unexpected value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

const MAX_TITLE_LEN: usize = 255;

/// Content of a notification before it is persisted and fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDraft {
    #[serde(default, rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn clamp_title(mut title: String) -> String {
    if let Some((cut, _)) = title.char_indices().nth(MAX_TITLE_LEN) {
        title.truncate(cut);
    }
    title
}

impl NotificationDraft {
    /// Builds a plain draft with no attachments or schedule. Titles longer than
    /// the allowed length are cut at a character boundary.
    pub fn new(kind: NotificationType, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: clamp_title(title.into()),
            body: body.into(),
            data: None,
            image_url: None,
            action_url: None,
            scheduled_at: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Checks the draft before anything is written.
    pub fn validate(&self) -> Result<(), DraftError> {
        if self.title.trim().is_empty() {
            return Err(DraftError::EmptyTitle);
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(DraftError::TitleTooLong(MAX_TITLE_LEN));
        }
        if self.body.trim().is_empty() {
            return Err(DraftError::EmptyBody);
        }
        if let Some(data) = &self.data {
            if !data.is_object() {
                return Err(DraftError::DataNotObject);
            }
        }
        for url in [&self.image_url, &self.action_url].into_iter().flatten() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(DraftError::InvalidUrl(url.clone()));
            }
        }
        Ok(())
    }

    /// Returns `true` when delivery must wait for the maintenance worker.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at > now)
    }
}

/// Validation failures for [`NotificationDraft`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("title must be at most {0} characters")]
    TitleTooLong(usize),
    #[error("body must not be empty")]
    EmptyBody,
    #[error("data must be a JSON object")]
    DataNotObject,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn enums_roundtrip_through_database_names() {
        for role in Role::DEFAULTS {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert_eq!(
            "lesson_created".parse::<NotificationType>().unwrap(),
            NotificationType::LessonCreated
        );
        assert_eq!(
            "failed".parse::<NotificationStatus>().unwrap(),
            NotificationStatus::Failed
        );
        assert_eq!("late".parse::<HomeworkStatus>().unwrap(), HomeworkStatus::Late);

        let err = "admin".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "role");
        assert_eq!(err.value, "admin");
    }

    #[test]
    fn draft_defaults_to_system_type() {
        let draft: NotificationDraft =
            serde_json::from_value(json!({ "title": "Hello", "body": "World" })).unwrap();
        assert_eq!(draft.kind, NotificationType::System);
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn draft_validation_rejects_bad_input() {
        let mut draft = NotificationDraft::new(NotificationType::Announcement, " ", "body");
        assert_eq!(draft.validate(), Err(DraftError::EmptyTitle));

        draft.title = "x".repeat(256);
        assert_eq!(draft.validate(), Err(DraftError::TitleTooLong(255)));

        draft.title = "Title".into();
        draft.data = Some(json!([1, 2]));
        assert_eq!(draft.validate(), Err(DraftError::DataNotObject));

        draft.data = None;
        draft.action_url = Some("javascript:alert(1)".into());
        assert!(matches!(draft.validate(), Err(DraftError::InvalidUrl(_))));
    }

    #[test]
    fn built_drafts_clamp_long_titles() {
        let draft = NotificationDraft::new(
            NotificationType::HomeworkAssigned,
            format!("New homework: {}", "é".repeat(300)),
            "body",
        );
        assert_eq!(draft.title.chars().count(), 255);
        assert!(draft.title.starts_with("New homework: é"));
        assert!(draft.validate().is_ok());

        let short = NotificationDraft::new(NotificationType::System, "Hi", "body");
        assert_eq!(short.title, "Hi");
    }

    #[test]
    fn scheduled_drafts_are_deferred_until_due() {
        let now = Utc::now();
        let mut draft = NotificationDraft::new(NotificationType::System, "t", "b");
        assert!(!draft.is_deferred(now));

        draft.scheduled_at = Some(now + Duration::minutes(5));
        assert!(draft.is_deferred(now));
        assert!(!draft.is_deferred(now + Duration::minutes(5)));
    }
}
