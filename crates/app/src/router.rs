use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use classroom_push::FcmClient;
use classroom_storage::Database;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::dispatch::NotificationDispatcher;
use crate::session::SessionManager;
use crate::token::AccessTokenCodec;
use crate::{auth, devices, groups, homework, lessons, maintenance, notifications, telemetry, users};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lifetimes applied to issued credentials and stored notifications.
#[derive(Debug, Clone, Copy)]
pub struct Lifetimes {
    pub access_token: Duration,
    pub refresh_token: Duration,
    pub notification: Duration,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            access_token: Duration::seconds(1800),
            refresh_token: Duration::days(30),
            notification: Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    tokens: AccessTokenCodec,
    sessions: SessionManager,
    dispatcher: NotificationDispatcher,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        jwt_secret: &[u8],
        lifetimes: Lifetimes,
        push: Option<FcmClient>,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let tokens = AccessTokenCodec::new(jwt_secret, lifetimes.access_token);
        let sessions = SessionManager::new(
            storage.clone(),
            tokens.clone(),
            jwt_secret,
            lifetimes.refresh_token,
            clock.clone(),
        );
        let dispatcher =
            NotificationDispatcher::new(storage.clone(), push, lifetimes.notification, clock.clone());
        Self {
            metrics,
            storage,
            clock,
            tokens,
            sessions,
            dispatcher,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock.clone();
        self.sessions = self.sessions.with_clock(clock.clone());
        self.dispatcher = self.dispatcher.with_clock(clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn tokens(&self) -> &AccessTokenCodec {
        &self.tokens
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/sessions", get(auth::sessions))
        .route("/auth/sessions/:id", delete(auth::revoke_session))
        .route("/users/me", get(users::me))
        .route("/users", get(users::list))
        .route(
            "/users/:id",
            get(users::get).put(users::update).delete(users::remove),
        )
        .route("/roles", get(users::roles))
        .route("/device-token/register", post(devices::register))
        .route("/device-token/user/:user_id", get(devices::list_for_user))
        .route("/notifications", get(notifications::list))
        .route("/notifications/stats", get(notifications::stats))
        .route("/notifications/send", post(notifications::send))
        .route("/notifications/send-multiple", post(notifications::send_multiple))
        .route("/notifications/debug/send-test", post(notifications::send_test))
        .route("/notifications/read-all", patch(notifications::mark_all_read))
        .route("/notifications/cleanup", post(notifications::cleanup))
        .route("/notifications/:id/read", patch(notifications::mark_read))
        .route("/notifications/:id", delete(notifications::remove))
        .route("/groups", get(groups::list_mine).post(groups::create))
        .route("/groups/:id", get(groups::get))
        .route("/lessons", get(lessons::list_mine).post(lessons::create))
        .route("/lessons/:id", get(lessons::get).delete(lessons::remove))
        .route(
            "/lessons/:id/video",
            post(lessons::attach_video).delete(lessons::remove_video),
        )
        .route("/homework", post(homework::create))
        .route("/homework/student", get(homework::list_for_student))
        .route("/homework/teacher", get(homework::list_for_teacher))
        .route("/homework/:id", get(homework::get).delete(homework::remove))
        .route(
            "/homework/assignments/:id/submit",
            post(homework::submit),
        )
        .route("/homework/assignments/:id/grade", post(homework::grade))
        .route("/admin/cleanup", post(maintenance::cleanup))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}
