use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use classroom_core::{require_role, require_self_or, Role};
use classroom_storage::{RoleRecord, UserRecord};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

/// Public view of an account. The password hash never leaves the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserRecord> for UserView {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoleView {
    pub id: i64,
    pub name: Role,
}

impl From<RoleRecord> for RoleView {
    fn from(role: RoleRecord) -> Self {
        Self {
            id: role.id,
            name: role.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: String,
}

pub async fn me(AuthUser(user): AuthUser) -> Json<UserView> {
    Json(user.into())
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<UserView>>, ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let users = state
        .storage()
        .users()
        .list()
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<UserView>, ProblemResponse> {
    require_self_or(caller.id, caller.role, id, &[Role::Teacher])?;
    let user = state
        .storage()
        .users()
        .find_by_id(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;
    Ok(Json(user.into()))
}

pub async fn update(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<UserView>, ProblemResponse> {
    require_self_or(caller.id, caller.role, id, &[Role::Teacher])?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "name must not be empty",
        ));
    }

    let user = state
        .storage()
        .users()
        .update_name(id, name, state.now())
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("user not found"))?;
    Ok(Json(user.into()))
}

pub async fn remove(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let deleted = state
        .storage()
        .users()
        .delete(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    if !deleted {
        return Err(ProblemResponse::not_found("user not found"));
    }
    info!(stage = "app", user_id = id, deleted_by = caller.id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn roles(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
) -> Result<Json<Vec<RoleView>>, ProblemResponse> {
    let roles = state
        .storage()
        .roles()
        .list()
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(roles.into_iter().map(RoleView::from).collect()))
}
