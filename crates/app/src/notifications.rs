use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use classroom_core::{require_role, NotificationDraft, NotificationType, Page, Role};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::{DispatchError, InboxPage, NotificationStats, NotificationView};
use crate::maintenance::record_ttl;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub user_id: i64,
    #[serde(flatten)]
    pub draft: NotificationDraft,
}

#[derive(Debug, Deserialize)]
pub struct SendMultipleRequest {
    pub user_ids: Vec<i64>,
    #[serde(flatten)]
    pub draft: NotificationDraft,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendTestRequest {
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl From<DispatchError> for ProblemResponse {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidDraft(err) => {
                Self::bad_request("validation_error", err.to_string())
            }
            DispatchError::NoRecipients => Self::bad_request("no_recipients", err.to_string()),
            DispatchError::UnknownRecipients(_) => {
                Self::bad_request("unknown_recipients", err.to_string())
            }
            DispatchError::NotFound => Self::not_found(err.to_string()),
            DispatchError::Database(err) => Self::internal("notify", err),
        }
    }
}

pub async fn send(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<SendRequest>,
) -> Result<(StatusCode, Json<NotificationView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let view = state
        .dispatcher()
        .create_and_send(body.user_id, &body.draft)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn send_multiple(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<SendMultipleRequest>,
) -> Result<(StatusCode, Json<NotificationView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let view = state
        .dispatcher()
        .create_and_send_to_multiple(&body.user_ids, &body.draft)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Pushes a canned notification, to the caller unless another user is named.
pub async fn send_test(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    body: Option<Json<SendTestRequest>>,
) -> Result<(StatusCode, Json<NotificationView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let target = body
        .and_then(|Json(body)| body.user_id)
        .unwrap_or(caller.id);
    let draft = NotificationDraft::new(
        NotificationType::System,
        "Test notification",
        "Push delivery is working.",
    )
    .with_data(json!({ "test": true }));
    let view = state.dispatcher().create_and_send(target, &draft).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<InboxPage>, ProblemResponse> {
    let page = Page::new(query.page, query.limit, DEFAULT_PAGE_SIZE);
    Ok(Json(state.dispatcher().user_notifications(user.id, page).await?))
}

pub async fn stats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<NotificationStats>, ProblemResponse> {
    Ok(Json(state.dispatcher().stats(user.id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ProblemResponse> {
    state.dispatcher().mark_as_read(user.id, id).await?;
    Ok(Json(json!({ "id": id, "is_read": true })))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let updated = state.dispatcher().mark_all_as_read(user.id).await?;
    Ok(Json(json!({ "updated_count": updated })))
}

pub async fn remove(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    state.dispatcher().delete(user.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cleanup(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let deleted = state.dispatcher().cleanup_expired().await?;
    record_ttl("notifications", deleted);
    Ok(Json(json!({ "deleted_count": deleted })))
}
