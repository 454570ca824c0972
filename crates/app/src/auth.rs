use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::session::{SessionError, SessionView, TokenPair};
use crate::token::{AuthUser, ClientInfo};
use crate::users::UserView;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: UserView,
}

impl From<SessionError> for ProblemResponse {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidInput(detail) => Self::bad_request("validation_error", detail),
            SessionError::DuplicateEmail => {
                Self::new(StatusCode::CONFLICT, "email_taken", err.to_string())
            }
            SessionError::InvalidCredentials => {
                Self::unauthorized("invalid_credentials", err.to_string())
            }
            SessionError::InvalidRefreshToken => {
                Self::unauthorized("invalid_refresh_token", err.to_string())
            }
            SessionError::RevokedRefreshToken => {
                Self::unauthorized("refresh_token_revoked", err.to_string())
            }
            SessionError::ExpiredRefreshToken => {
                Self::unauthorized("refresh_token_expired", err.to_string())
            }
            SessionError::SessionNotFound => Self::not_found(err.to_string()),
            other => Self::internal("session", other),
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserView>), ProblemResponse> {
    let user = state
        .sessions()
        .register(
            body.name.as_deref().unwrap_or_default(),
            &body.email,
            &body.password,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ProblemResponse> {
    let result = state
        .sessions()
        .login(&body.email, &body.password, &client)
        .await?;
    Ok(Json(LoginResponse {
        tokens: result.tokens,
        user: result.user.into(),
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, ProblemResponse> {
    let tokens = state.sessions().refresh(&body.refresh_token).await?;
    Ok(Json(tokens))
}

/// Revokes the supplied refresh token. Works without an access token so that clients
/// whose access token already lapsed can still sign out.
pub async fn logout(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    state.sessions().logout(&body.refresh_token).await?;
    Ok(Json(json!({ "message": "logged out" })))
}

pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let revoked = state.sessions().logout_all(user.id).await?;
    Ok(Json(json!({
        "message": "logged out from all devices",
        "revoked_count": revoked,
    })))
}

pub async fn sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<SessionView>>, ProblemResponse> {
    Ok(Json(state.sessions().active_sessions(user.id).await?))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<i64>,
) -> Result<Json<Value>, ProblemResponse> {
    state.sessions().revoke_session(user.id, session_id).await?;
    Ok(Json(json!({ "message": "session revoked" })))
}
