mod classroom;
mod device_tokens;
mod notifications;
mod refresh_tokens;
mod users;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

pub use classroom::{
    AssignmentRecord, AssignmentWithStudent, ClassroomError, GradeUpdate, GroupRecord,
    GroupRepository, HomeworkRecord, HomeworkRepository, LessonRecord, LessonRepository,
    NewHomework, NewLesson, StudentAssignment, Submission, VideoMetadata,
};
pub use device_tokens::{DeviceTokenError, DeviceTokenRecord, DeviceTokenRepository, UserDeviceToken};
pub use notifications::{
    DeliveryUpdate, NewNotification, NotificationError, NotificationRecord,
    NotificationRepository, TypeCount, UserNotificationRow,
};
pub use refresh_tokens::{
    NewRefreshToken, RefreshTokenError, RefreshTokenRecord, RefreshTokenRepository,
};
pub use users::{NewUser, RoleRecord, RoleRepository, UserError, UserRecord, UserRepository};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction spanning several repositories.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    pub fn roles(&self) -> RoleRepository {
        RoleRepository::new(self.pool.clone())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// Returns a handle for the refresh-token (session) table.
    pub fn refresh_tokens(&self) -> RefreshTokenRepository {
        RefreshTokenRepository::new(self.pool.clone())
    }

    /// Returns a handle for push device registrations.
    pub fn device_tokens(&self) -> DeviceTokenRepository {
        DeviceTokenRepository::new(self.pool.clone())
    }

    /// Returns a handle for notifications and their recipient rows.
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    pub fn groups(&self) -> GroupRepository {
        GroupRepository::new(self.pool.clone())
    }

    pub fn lessons(&self) -> LessonRepository {
        LessonRepository::new(self.pool.clone())
    }

    pub fn homework(&self) -> HomeworkRepository {
        HomeworkRepository::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Formats timestamps so that text comparison in SQL matches chronological order.
pub fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("2067"))
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("787"))
}

/// Builds `?, ?, ?` for `IN (...)` clauses.
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
