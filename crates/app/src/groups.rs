use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use classroom_core::{require_role, AccessError, Role};
use classroom_storage::{ClassroomError, GroupRecord};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub student_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub id: i64,
    pub name: String,
    pub teacher_id: i64,
    pub student_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

impl GroupView {
    fn new(group: GroupRecord, student_ids: Vec<i64>) -> Self {
        Self {
            id: group.id,
            name: group.name,
            teacher_id: group.teacher_id,
            student_ids,
            created_at: group.created_at,
        }
    }
}

/// Rejects ids that do not belong to an existing user.
pub(crate) async fn ensure_users_exist(
    state: &AppState,
    ids: &[i64],
) -> Result<(), ProblemResponse> {
    let existing = state
        .storage()
        .users()
        .existing_ids(ids)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    let missing: Vec<i64> = ids
        .iter()
        .copied()
        .filter(|id| !existing.contains(id))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProblemResponse::bad_request(
            "unknown_students",
            format!("unknown student ids: {missing:?}"),
        ))
    }
}

pub async fn create(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "name must not be empty",
        ));
    }

    let mut student_ids = body.student_ids;
    student_ids.sort_unstable();
    student_ids.dedup();
    ensure_users_exist(&state, &student_ids).await?;

    let group = state
        .storage()
        .groups()
        .create(name, caller.id, &student_ids, state.now())
        .await
        .map_err(|err| match err {
            ClassroomError::UnknownReference => {
                ProblemResponse::bad_request("unknown_students", err.to_string())
            }
            ClassroomError::Database(err) => ProblemResponse::internal("storage", err),
        })?;

    info!(
        stage = "app",
        group_id = group.id,
        students = student_ids.len(),
        "group created"
    );
    Ok((StatusCode::CREATED, Json(GroupView::new(group, student_ids))))
}

pub async fn list_mine(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<GroupView>>, ProblemResponse> {
    let repo = state.storage().groups();
    let groups = match caller.role {
        Role::Teacher => repo.list_for_teacher(caller.id).await,
        Role::Student => repo.list_for_student(caller.id).await,
    }
    .map_err(|err| ProblemResponse::internal("storage", err))?;

    let mut views = Vec::with_capacity(groups.len());
    for group in groups {
        let students = repo
            .student_ids(group.id)
            .await
            .map_err(|err| ProblemResponse::internal("storage", err))?;
        views.push(GroupView::new(group, students));
    }
    Ok(Json(views))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<GroupView>, ProblemResponse> {
    let repo = state.storage().groups();
    let group = repo
        .find_by_id(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("group not found"))?;
    let students = repo
        .student_ids(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;

    if group.teacher_id != caller.id && !students.contains(&caller.id) {
        return Err(AccessError::NotOwner.into());
    }
    Ok(Json(GroupView::new(group, students)))
}
