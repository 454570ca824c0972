use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use classroom_core::{require_self_or, Role};
use classroom_storage::{DeviceTokenError, DeviceTokenRecord};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceTokenView {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl From<DeviceTokenRecord> for DeviceTokenView {
    fn from(record: DeviceTokenRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            token: record.token,
            created_at: record.created_at,
        }
    }
}

/// Binds the caller's push token, replacing any token they held before.
pub async fn register(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<RegisterDeviceRequest>,
) -> Result<Json<DeviceTokenView>, ProblemResponse> {
    let token = body.token.trim();
    if token.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "token must not be empty",
        ));
    }

    let record = state
        .storage()
        .device_tokens()
        .register(user.id, token, state.now())
        .await
        .map_err(|err| match err {
            DeviceTokenError::MissingUser => ProblemResponse::not_found("user not found"),
            DeviceTokenError::Database(err) => ProblemResponse::internal("storage", err),
        })?;
    info!(stage = "push", user_id = user.id, "device token registered");
    Ok(Json(record.into()))
}

pub async fn list_for_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<DeviceTokenView>>, ProblemResponse> {
    require_self_or(caller.id, caller.role, user_id, &[Role::Teacher])?;
    let tokens = state
        .storage()
        .device_tokens()
        .list_for_user(user_id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(Json(tokens.into_iter().map(DeviceTokenView::from).collect()))
}
