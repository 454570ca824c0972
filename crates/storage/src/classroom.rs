use chrono::{DateTime, Utc};
use classroom_core::HomeworkStatus;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::{is_foreign_key_violation, to_rfc3339};

/// Errors shared by the group, lesson and homework repositories.
#[derive(Debug, Error)]
pub enum ClassroomError {
    #[error("referenced user or group does not exist")]
    UnknownReference,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_reference(err: sqlx::Error) -> ClassroomError {
    if is_foreign_key_violation(&err) {
        ClassroomError::UnknownReference
    } else {
        ClassroomError::Database(err)
    }
}

#[derive(Clone)]
pub struct GroupRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    pub teacher_id: i64,
    pub created_at: DateTime<Utc>,
}

impl GroupRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a group with its initial members.
    pub async fn create(
        &self,
        name: &str,
        teacher_id: i64,
        student_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<GroupRecord, ClassroomError> {
        let mut tx = self.pool.begin().await?;
        let group = sqlx::query_as::<_, GroupRecord>(
            "INSERT INTO groups (name, teacher_id, created_at) VALUES (?, ?, ?) \
             RETURNING id, name, teacher_id, created_at",
        )
        .bind(name)
        .bind(teacher_id)
        .bind(to_rfc3339(now))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_reference)?;

        for student_id in student_ids {
            sqlx::query(
                "INSERT INTO group_students (group_id, student_id) VALUES (?, ?) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(group.id)
            .bind(student_id)
            .execute(&mut *tx)
            .await
            .map_err(map_reference)?;
        }

        tx.commit().await?;
        Ok(group)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<GroupRecord>, sqlx::Error> {
        sqlx::query_as::<_, GroupRecord>(
            "SELECT id, name, teacher_id, created_at FROM groups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn student_ids(&self, group_id: i64) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT student_id FROM group_students WHERE group_id = ? ORDER BY student_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_for_teacher(&self, teacher_id: i64) -> Result<Vec<GroupRecord>, sqlx::Error> {
        sqlx::query_as::<_, GroupRecord>(
            "SELECT id, name, teacher_id, created_at FROM groups WHERE teacher_id = ? ORDER BY id",
        )
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_for_student(&self, student_id: i64) -> Result<Vec<GroupRecord>, sqlx::Error> {
        sqlx::query_as::<_, GroupRecord>(
            "SELECT g.id, g.name, g.teacher_id, g.created_at FROM groups AS g \
               JOIN group_students AS gs ON gs.group_id = g.id \
              WHERE gs.student_id = ? ORDER BY g.id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Clone)]
pub struct LessonRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LessonRecord {
    pub id: i64,
    pub name: String,
    pub content: Option<String>,
    pub video_url: Option<String>,
    pub video_path: Option<String>,
    pub video_size: Option<i64>,
    pub group_id: Option<i64>,
    pub creator_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

pub struct NewLesson<'a> {
    pub name: &'a str,
    pub content: Option<&'a str>,
    pub group_id: i64,
    pub creator_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Video attachment stored on a lesson. The file itself lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub url: String,
    pub path: Option<String>,
    pub size: Option<i64>,
}

const LESSON_COLUMNS: &str =
    "id, name, content, video_url, video_path, video_size, group_id, creator_id, created_at";

impl LessonRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, lesson: &NewLesson<'_>) -> Result<LessonRecord, ClassroomError> {
        sqlx::query_as::<_, LessonRecord>(&format!(
            "INSERT INTO lessons (name, content, group_id, creator_id, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {LESSON_COLUMNS}"
        ))
        .bind(lesson.name)
        .bind(lesson.content)
        .bind(lesson.group_id)
        .bind(lesson.creator_id)
        .bind(to_rfc3339(lesson.created_at))
        .fetch_one(&self.pool)
        .await
        .map_err(map_reference)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<LessonRecord>, sqlx::Error> {
        sqlx::query_as::<_, LessonRecord>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Replaces (or clears with `None`) the lesson's video metadata.
    pub async fn set_video(
        &self,
        id: i64,
        video: Option<&VideoMetadata>,
    ) -> Result<Option<LessonRecord>, sqlx::Error> {
        sqlx::query_as::<_, LessonRecord>(&format!(
            "UPDATE lessons SET video_url = ?, video_path = ?, video_size = ? WHERE id = ? \
             RETURNING {LESSON_COLUMNS}"
        ))
        .bind(video.map(|v| v.url.as_str()))
        .bind(video.and_then(|v| v.path.as_deref()))
        .bind(video.and_then(|v| v.size))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_by_creator(
        &self,
        creator_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LessonRecord>, sqlx::Error> {
        sqlx::query_as::<_, LessonRecord>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons WHERE creator_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(creator_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count_by_creator(&self, creator_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM lessons WHERE creator_id = ?")
            .bind(creator_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let done = sqlx::query("DELETE FROM lessons WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct HomeworkRepository {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HomeworkRecord {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub file_url: Option<String>,
    pub due_date: DateTime<Utc>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

pub struct NewHomework<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub file_url: Option<&'a str>,
    pub due_date: DateTime<Utc>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

/// One student's copy of a homework.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AssignmentRecord {
    pub id: i64,
    pub homework_id: i64,
    pub student_id: i64,
    #[sqlx(try_from = "String")]
    pub status: HomeworkStatus,
    pub submit_file_url: Option<String>,
    pub submission_text: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
    pub grade: Option<String>,
    pub feedback: Option<String>,
}

/// Assignment joined with the student it belongs to.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AssignmentWithStudent {
    #[sqlx(flatten)]
    pub assignment: AssignmentRecord,
    pub student_name: String,
    pub student_email: String,
}

/// Assignment joined with its homework, as listed for a student.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StudentAssignment {
    #[sqlx(flatten)]
    pub assignment: AssignmentRecord,
    pub title: String,
    pub description: Option<String>,
    pub file_url: Option<String>,
    pub due_date: DateTime<Utc>,
    pub created_by: i64,
}

pub struct Submission<'a> {
    pub submission_text: Option<&'a str>,
    pub file_url: Option<&'a str>,
    pub submitted_at: DateTime<Utc>,
}

pub struct GradeUpdate<'a> {
    pub grade: &'a str,
    pub feedback: Option<&'a str>,
    pub graded_at: DateTime<Utc>,
}

const HOMEWORK_COLUMNS: &str = "id, title, description, file_url, due_date, created_by, created_at";

const ASSIGNMENT_COLUMNS: &str = "a.id, a.homework_id, a.student_id, a.status, \
     a.submit_file_url, a.submission_text, a.submitted_at, a.graded_at, a.grade, a.feedback";

impl HomeworkRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the homework and a pending assignment per student in one transaction.
    pub async fn create(
        &self,
        homework: &NewHomework<'_>,
        student_ids: &[i64],
    ) -> Result<HomeworkRecord, ClassroomError> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, HomeworkRecord>(&format!(
            "INSERT INTO homework (title, description, file_url, due_date, created_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {HOMEWORK_COLUMNS}"
        ))
        .bind(homework.title)
        .bind(homework.description)
        .bind(homework.file_url)
        .bind(to_rfc3339(homework.due_date))
        .bind(homework.created_by)
        .bind(to_rfc3339(homework.created_at))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_reference)?;

        for student_id in student_ids {
            sqlx::query(
                "INSERT INTO homework_assignments (homework_id, student_id, status) \
                 VALUES (?, ?, ?) ON CONFLICT(homework_id, student_id) DO NOTHING",
            )
            .bind(record.id)
            .bind(student_id)
            .bind(HomeworkStatus::Pending.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_reference)?;
        }

        tx.commit().await?;
        Ok(record)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<HomeworkRecord>, sqlx::Error> {
        sqlx::query_as::<_, HomeworkRecord>(&format!(
            "SELECT {HOMEWORK_COLUMNS} FROM homework WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_for_teacher(&self, teacher_id: i64) -> Result<Vec<HomeworkRecord>, sqlx::Error> {
        sqlx::query_as::<_, HomeworkRecord>(&format!(
            "SELECT {HOMEWORK_COLUMNS} FROM homework WHERE created_by = ? \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_for_student(
        &self,
        student_id: i64,
    ) -> Result<Vec<StudentAssignment>, sqlx::Error> {
        sqlx::query_as::<_, StudentAssignment>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS}, h.title, h.description, h.file_url, h.due_date, h.created_by \
               FROM homework_assignments AS a \
               JOIN homework AS h ON h.id = a.homework_id \
              WHERE a.student_id = ? \
              ORDER BY h.due_date ASC, a.id ASC"
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn assignments(
        &self,
        homework_id: i64,
    ) -> Result<Vec<AssignmentWithStudent>, sqlx::Error> {
        sqlx::query_as::<_, AssignmentWithStudent>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS}, u.name AS student_name, u.email AS student_email \
               FROM homework_assignments AS a \
               JOIN users AS u ON u.id = a.student_id \
              WHERE a.homework_id = ? \
              ORDER BY a.id"
        ))
        .bind(homework_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_assignment(&self, id: i64) -> Result<Option<AssignmentRecord>, sqlx::Error> {
        sqlx::query_as::<_, AssignmentRecord>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM homework_assignments AS a WHERE a.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Stores a submission. Already submitted assignments are left untouched.
    pub async fn submit(
        &self,
        assignment_id: i64,
        submission: &Submission<'_>,
    ) -> Result<Option<AssignmentRecord>, sqlx::Error> {
        sqlx::query_as::<_, AssignmentRecord>(
            "UPDATE homework_assignments \
             SET status = ?, submission_text = ?, \
                 submit_file_url = COALESCE(?, submit_file_url), submitted_at = ? \
             WHERE id = ? AND status != ? \
             RETURNING id, homework_id, student_id, status, submit_file_url, submission_text, \
                       submitted_at, graded_at, grade, feedback",
        )
        .bind(HomeworkStatus::Submitted.as_str())
        .bind(submission.submission_text)
        .bind(submission.file_url)
        .bind(to_rfc3339(submission.submitted_at))
        .bind(assignment_id)
        .bind(HomeworkStatus::Submitted.as_str())
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn grade(
        &self,
        assignment_id: i64,
        update: &GradeUpdate<'_>,
    ) -> Result<Option<AssignmentRecord>, sqlx::Error> {
        sqlx::query_as::<_, AssignmentRecord>(
            "UPDATE homework_assignments \
             SET status = ?, grade = ?, feedback = COALESCE(?, feedback), graded_at = ? \
             WHERE id = ? \
             RETURNING id, homework_id, student_id, status, submit_file_url, submission_text, \
                       submitted_at, graded_at, grade, feedback",
        )
        .bind(HomeworkStatus::Graded.as_str())
        .bind(update.grade)
        .bind(update.feedback)
        .bind(to_rfc3339(update.graded_at))
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Deletes a homework; its assignments cascade.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let done = sqlx::query("DELETE FROM homework WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}
