use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use classroom_core::{
    require_role, AccessError, NotificationDraft, NotificationType, Page, Role,
};
use classroom_storage::{ClassroomError, LessonRecord, NewLesson, VideoMetadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::notifications::PageQuery;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::token::AuthUser;

const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct CreateLessonRequest {
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
    pub group_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AttachVideoRequest {
    pub video_url: String,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub video_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LessonView {
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

impl From<LessonRecord> for LessonView {
    fn from(lesson: LessonRecord) -> Self {
        Self {
            id: lesson.id,
            name: lesson.name,
            content: lesson.content,
            video_url: lesson.video_url,
            video_path: lesson.video_path,
            video_size: lesson.video_size,
            group_id: lesson.group_id,
            creator_id: lesson.creator_id,
            created_at: lesson.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LessonPage {
    pub lessons: Vec<LessonView>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

async fn load_lesson(state: &AppState, id: i64) -> Result<LessonRecord, ProblemResponse> {
    state
        .storage()
        .lessons()
        .find_by_id(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("lesson not found"))
}

fn require_creator(lesson: &LessonRecord, user_id: i64) -> Result<(), ProblemResponse> {
    if lesson.creator_id == Some(user_id) {
        Ok(())
    } else {
        Err(AccessError::NotOwner.into())
    }
}

async fn group_students(state: &AppState, group_id: Option<i64>) -> Vec<i64> {
    let Some(group_id) = group_id else {
        return Vec::new();
    };
    match state.storage().groups().student_ids(group_id).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(stage = "notify", group_id, error = %err, "failed to load group students");
            Vec::new()
        }
    }
}

/// Creates a lesson in a group the caller teaches and tells the group's students.
pub async fn create(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Json(body): Json<CreateLessonRequest>,
) -> Result<(StatusCode, Json<LessonView>), ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "name must not be empty",
        ));
    }

    let group = state
        .storage()
        .groups()
        .find_by_id(body.group_id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("group not found"))?;
    if group.teacher_id != caller.id {
        return Err(AccessError::NotOwner.into());
    }

    let lesson = state
        .storage()
        .lessons()
        .insert(&NewLesson {
            name,
            content: body.content.as_deref(),
            group_id: group.id,
            creator_id: caller.id,
            created_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            ClassroomError::UnknownReference => ProblemResponse::not_found("group not found"),
            ClassroomError::Database(err) => ProblemResponse::internal("storage", err),
        })?;
    info!(stage = "app", lesson_id = lesson.id, group_id = group.id, "lesson created");

    let students = group_students(&state, lesson.group_id).await;
    let draft = NotificationDraft::new(
        NotificationType::LessonCreated,
        format!("New lesson: {}", lesson.name),
        format!("A new lesson was published in {}", group.name),
    )
    .with_data(json!({ "lesson_id": lesson.id, "group_id": group.id }));
    state.dispatcher().notify_quietly(&students, &draft).await;

    Ok((StatusCode::CREATED, Json(lesson.into())))
}

pub async fn attach_video(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<AttachVideoRequest>,
) -> Result<Json<LessonView>, ProblemResponse> {
    let lesson = load_lesson(&state, id).await?;
    require_creator(&lesson, caller.id)?;
    let url = body.video_url.trim();
    if url.is_empty() {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "video_url must not be empty",
        ));
    }
    if body.video_size.is_some_and(|size| size < 0) {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "video_size must not be negative",
        ));
    }

    let video = VideoMetadata {
        url: url.to_string(),
        path: body.video_path,
        size: body.video_size,
    };
    let lesson = state
        .storage()
        .lessons()
        .set_video(id, Some(&video))
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("lesson not found"))?;

    let students = group_students(&state, lesson.group_id).await;
    let draft = NotificationDraft::new(
        NotificationType::LessonCreated,
        format!("New video: {}", lesson.name),
        "A video was added to your lesson",
    )
    .with_data(json!({ "lesson_id": lesson.id, "video_url": video.url }));
    state.dispatcher().notify_quietly(&students, &draft).await;

    Ok(Json(lesson.into()))
}

pub async fn remove_video(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<LessonView>, ProblemResponse> {
    let lesson = load_lesson(&state, id).await?;
    require_creator(&lesson, caller.id)?;
    if lesson.video_url.is_none() {
        return Err(ProblemResponse::bad_request(
            "no_video",
            "lesson has no video attached",
        ));
    }

    let lesson = state
        .storage()
        .lessons()
        .set_video(id, None)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?
        .ok_or_else(|| ProblemResponse::not_found("lesson not found"))?;
    Ok(Json(lesson.into()))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<LessonView>, ProblemResponse> {
    let lesson = load_lesson(&state, id).await?;
    if lesson.creator_id != Some(caller.id) {
        let students = match lesson.group_id {
            Some(group_id) => state
                .storage()
                .groups()
                .student_ids(group_id)
                .await
                .map_err(|err| ProblemResponse::internal("storage", err))?,
            None => Vec::new(),
        };
        if !students.contains(&caller.id) {
            return Err(AccessError::NotOwner.into());
        }
    }
    Ok(Json(lesson.into()))
}

pub async fn list_mine(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<LessonPage>, ProblemResponse> {
    let page = Page::new(query.page, query.limit, DEFAULT_PAGE_SIZE);
    let repo = state.storage().lessons();
    let lessons = repo
        .list_by_creator(caller.id, page.limit(), page.offset())
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    let total = repo
        .count_by_creator(caller.id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;

    Ok(Json(LessonPage {
        lessons: lessons.into_iter().map(LessonView::from).collect(),
        total,
        page: page.page,
        limit: page.limit,
        total_pages: page.total_pages(total),
    }))
}

pub async fn remove(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    let lesson = load_lesson(&state, id).await?;
    require_creator(&lesson, caller.id)?;
    state
        .storage()
        .lessons()
        .delete(id)
        .await
        .map_err(|err| ProblemResponse::internal("storage", err))?;
    Ok(StatusCode::NO_CONTENT)
}
