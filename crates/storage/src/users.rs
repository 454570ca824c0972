use chrono::{DateTime, Utc};
use classroom_core::Role;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_unique_violation, placeholders, to_rfc3339};

/// Repository for the static role table.
#[derive(Clone)]
pub struct RoleRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RoleRecord {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub name: Role,
}

impl RoleRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts every default role that is not present yet.
    pub async fn seed_defaults(&self) -> Result<(), sqlx::Error> {
        for role in Role::DEFAULTS {
            sqlx::query("INSERT INTO roles (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
                .bind(role.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn find_by_name(&self, role: Role) -> Result<Option<RoleRecord>, sqlx::Error> {
        sqlx::query_as::<_, RoleRecord>("SELECT id, name FROM roles WHERE name = ?")
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list(&self) -> Result<Vec<RoleRecord>, sqlx::Error> {
        sqlx::query_as::<_, RoleRecord>("SELECT id, name FROM roles ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }
}

/// Repository for user accounts.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

/// User row joined with its role name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters required to insert a user.
pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while mutating users.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("a user with this email already exists")]
    DuplicateEmail,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const USER_COLUMNS: &str = "u.id, u.name, u.email, u.password_hash, r.name AS role, \
                            u.created_at, u.updated_at";

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new user and returns the stored row.
    pub async fn insert(&self, user: &NewUser<'_>) -> Result<UserRecord, UserError> {
        let created_at = to_rfc3339(user.created_at);
        let result = sqlx::query(
            "INSERT INTO users (name, email, password_hash, role_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.name)
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.role_id)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(err) if is_unique_violation(&err) => return Err(UserError::DuplicateEmail),
            Err(err) => return Err(UserError::Database(err)),
        };

        self.find_by_id(id)
            .await?
            .ok_or(UserError::Database(sqlx::Error::RowNotFound))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users AS u JOIN roles AS r ON r.id = u.role_id \
             WHERE u.email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users AS u JOIN roles AS r ON r.id = u.role_id \
             WHERE u.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(&self) -> Result<Vec<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users AS u JOIN roles AS r ON r.id = u.role_id \
             ORDER BY u.id"
        ))
        .fetch_all(&self.pool)
        .await
    }

    /// Renames a user. Returns `None` when the user does not exist.
    pub async fn update_name(
        &self,
        id: i64,
        name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<UserRecord>, sqlx::Error> {
        let done = sqlx::query("UPDATE users SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(to_rfc3339(updated_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// Deletes a user; sessions and device tokens cascade.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let done = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Returns the subset of `ids` that belong to existing users.
    pub async fn existing_ids(&self, ids: &[i64]) -> Result<Vec<i64>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id FROM users WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.fetch_all(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_user, setup_db};

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let db = setup_db().await;
        db.roles().seed_defaults().await.expect("second seed");

        let roles = db.roles().list().await.expect("list");
        let names: Vec<Role> = roles.into_iter().map(|role| role.name).collect();
        assert_eq!(names, vec![Role::Teacher, Role::Student]);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_email() {
        let db = setup_db().await;
        let user = insert_user(&db, "ana@example.com", Role::Student).await;
        assert_eq!(user.role, Role::Student);
        assert_eq!(user.email, "ana@example.com");

        let role_id = db
            .roles()
            .find_by_name(Role::Student)
            .await
            .unwrap()
            .unwrap()
            .id;
        let err = db
            .users()
            .insert(&NewUser {
                name: "Other",
                email: "ana@example.com",
                password_hash: "hash",
                role_id,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::DuplicateEmail));
    }

    #[tokio::test]
    async fn lookups_update_and_delete() {
        let db = setup_db().await;
        let teacher = insert_user(&db, "tom@example.com", Role::Teacher).await;
        let repo = db.users();

        let found = repo
            .find_by_email("tom@example.com")
            .await
            .unwrap()
            .expect("user by email");
        assert_eq!(found.id, teacher.id);
        assert_eq!(found.role, Role::Teacher);

        let renamed = repo
            .update_name(teacher.id, "Thomas", Utc::now())
            .await
            .unwrap()
            .expect("renamed");
        assert_eq!(renamed.name, "Thomas");
        assert!(repo.update_name(9_999, "Ghost", Utc::now()).await.unwrap().is_none());

        assert!(repo.delete(teacher.id).await.unwrap());
        assert!(!repo.delete(teacher.id).await.unwrap());
        assert!(repo.find_by_id(teacher.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_ids_filters_unknown_users() {
        let db = setup_db().await;
        let a = insert_user(&db, "a@example.com", Role::Student).await;
        let b = insert_user(&db, "b@example.com", Role::Student).await;

        let ids = db
            .users()
            .existing_ids(&[b.id, 424_242, a.id])
            .await
            .unwrap();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(db.users().existing_ids(&[]).await.unwrap().is_empty());
    }
}
