use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use classroom_core::{
    require_role, AccessError, HomeworkStatus, NotificationDraft, NotificationType, Role,
};
use classroom_storage::{
    AssignmentRecord, AssignmentWithStudent, ClassroomError, GradeUpdate, HomeworkRecord,
    NewHomework, StudentAssignment, Submission,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::groups::ensure_users_exist;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

#[derive(Debug, Deserialize)]
pub struct CreateHomeworkRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    pub due_date: String,
    pub student_ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub submission_text: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub grade: String,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HomeworkView {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub file_url: Option<String>,
    pub due_date: DateTime<Utc>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

impl From<HomeworkRecord> for HomeworkView {
    fn from(record: HomeworkRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            file_url: record.file_url,
            due_date: record.due_date,
            created_by: record.created_by,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssignmentView {
    pub id: i64,
    pub homework_id: i64,
    pub student_id: i64,
    pub status: HomeworkStatus,
    pub submission_text: Option<String>,
    pub submit_file_url: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub grade: Option<String>,
    pub feedback: Option<String>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl From<AssignmentRecord> for AssignmentView {
    fn from(record: AssignmentRecord) -> Self {
        Self {
            id: record.id,
            homework_id: record.homework_id,
            student_id: record.student_id,
            status: record.status,
            submission_text: record.submission_text,
            submit_file_url: record.submit_file_url,
            submitted_at: record.submitted_at,
            grade: record.grade,
            feedback: record.feedback,
            graded_at: record.graded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RosterEntry {
    #[serde(flatten)]
    pub assignment: AssignmentView,
    pub student_name: String,
    pub student_email: String,
}

impl From<AssignmentWithStudent> for RosterEntry {
    fn from(row: AssignmentWithStudent) -> Self {
        Self {
            assignment: row.assignment.into(),
            student_name: row.student_name,
            student_email: row.student_email,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HomeworkDetail {
    #[serde(flatten)]
    pub homework: HomeworkView,
    pub assignments: Vec<RosterEntry>,
}

#[derive(Debug, Serialize)]
pub struct StudentHomeworkView {
    #[serde(flatten)]
    pub assignment: AssignmentView,
    pub title: String,
    pub description: Option<String>,
    pub file_url: Option<String>,
    pub due_date: DateTime<Utc>,
    pub created_by: i64,
}

impl From<StudentAssignment> for StudentHomeworkView {
    fn from(row: StudentAssignment) -> Self {
        Self {
            assignment: row.assignment.into(),
            title: row.title,
            description: row.description,
            file_url: row.file_url,
            due_date: row.due_date,
            created_by: row.created_by,
        }
    }
}

async fn load_homework(state: &AppState, id: i64) -> Result<HomeworkRecord, ProblemResponse> {
    state
        .storage()
        .homework()
        .find_by_id(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("homework not found"))
}

async fn load_assignment(state: &AppState, id: i64) -> Result<AssignmentRecord, ProblemResponse> {
    state
        .storage()
        .homework()
        .find_assignment(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("assignment not found"))
}

fn require_owner(homework: &HomeworkRecord, user_id: i64) -> Result<(), ProblemResponse> {
    if homework.created_by == user_id {
        Ok(())
    } else {
        Err(AccessError::NotOwner.into())
    }
}

/// Assigns new homework to each listed student and notifies them.
pub async fn create(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<CreateHomeworkRequest>,
) -> Result<(StatusCode, Json<HomeworkView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "title must not be empty",
        ));
    }
    let due_date = DateTime::parse_from_rfc3339(body.due_date.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| {
            ProblemResponse::bad_request("invalid_due_date", "due_date must be an RFC 3339 timestamp")
        })?;

    let mut student_ids = body.student_ids;
    student_ids.sort_unstable();
    student_ids.dedup();
    if student_ids.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "at least one student is required",
        ));
    }
    ensure_users_exist(&state, &student_ids).await?;

    let homework = state
        .storage()
        .homework()
        .create(
            &NewHomework {
                title,
                description: body.description.as_deref(),
                file_url: body.file_url.as_deref(),
                due_date,
                created_by: caller.id,
                created_at: state.now(),
            },
            &student_ids,
        )
        .await
        .map_err(|err| match err {
            ClassroomError::UnknownReference => {
                ProblemResponse::bad_request("unknown_students", err.to_string())
            }
            ClassroomError::Database(err) => ProblemResponse::internal("storage", err),
        })?;
    info!(
        stage = "app",
        homework_id = homework.id,
        students = student_ids.len(),
        "homework assigned"
    );

    let draft = NotificationDraft::new(
        NotificationType::HomeworkAssigned,
        format!("New homework: {}", homework.title),
        format!("Due {}", homework.due_date.format("%Y-%m-%d %H:%M UTC")),
    )
    .with_data(json!({
        "homework_id": homework.id,
        "due_date": homework.due_date,
    }));
    state.dispatcher().notify_quietly(&student_ids, &draft).await;

    Ok((StatusCode::CREATED, Json(homework.into())))
}

pub async fn list_for_student(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<StudentHomeworkView>>, ProblemResponse> {
    let rows = state
        .storage()
        .homework()
        .list_for_student(caller.id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(rows.into_iter().map(StudentHomeworkView::from).collect()))
}

pub async fn list_for_teacher(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<HomeworkView>>, ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let rows = state
        .storage()
        .homework()
        .list_for_teacher(caller.id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(rows.into_iter().map(HomeworkView::from).collect()))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<HomeworkDetail>, ProblemResponse> {
    let homework = load_homework(&state, id).await?;
    require_owner(&homework, caller.id)?;
    let roster = state
        .storage()
        .homework()
        .assignments(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(HomeworkDetail {
        homework: homework.into(),
        assignments: roster.into_iter().map(RosterEntry::from).collect(),
    }))
}

pub async fn submit(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<AssignmentView>, ProblemResponse> {
    let assignment = load_assignment(&state, id).await?;
    if assignment.student_id != caller.id {
        return Err(AccessError::NotOwner.into());
    }
    if assignment.status != HomeworkStatus::Pending {
        return Err(ProblemResponse::bad_request(
            "already_submitted",
            "assignment was already submitted",
        ));
    }
    let homework = load_homework(&state, assignment.homework_id).await?;
    let now = state.now();
    if now > homework.due_date {
        return Err(ProblemResponse::bad_request(
            "past_due",
            "the due date for this homework has passed",
        ));
    }

    let updated = state
        .storage()
        .homework()
        .submit(
            id,
            &Submission {
                submission_text: body.submission_text.as_deref(),
                file_url: body.file_url.as_deref(),
                submitted_at: now,
            },
        )
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| {
            ProblemResponse::bad_request("already_submitted", "assignment was already submitted")
        })?;
    info!(stage = "app", assignment_id = id, student_id = caller.id, "homework submitted");
    Ok(Json(updated.into()))
}

pub async fn grade(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<GradeRequest>,
) -> Result<Json<AssignmentView>, ProblemResponse> {
    let assignment = load_assignment(&state, id).await?;
    let homework = load_homework(&state, assignment.homework_id).await?;
    require_owner(&homework, caller.id)?;
    let grade = body.grade.trim();
    if grade.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "grade must not be empty",
        ));
    }

    let updated = state
        .storage()
        .homework()
        .grade(
            id,
            &GradeUpdate {
                grade,
                feedback: body.feedback.as_deref(),
                graded_at: state.now(),
            },
        )
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("assignment not found"))?;

    let draft = NotificationDraft::new(
        NotificationType::HomeworkGraded,
        format!("Homework graded: {}", homework.title),
        format!("Your grade: {grade}"),
    )
    .with_data(json!({
        "homework_id": homework.id,
        "assignment_id": updated.id,
        "grade": grade,
    }));
    state
        .dispatcher()
        .notify_quietly(&[updated.student_id], &draft)
        .await;

    Ok(Json(updated.into()))
}

pub async fn remove(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    let homework = load_homework(&state, id).await?;
    require_owner(&homework, caller.id)?;
    state
        .storage()
        .homework()
        .delete(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(StatusCode::NO_CONTENT)
}
