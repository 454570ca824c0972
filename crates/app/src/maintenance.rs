use std::time::Duration;

use axum::{extract::State, Json};
use classroom_core::{require_role, Role};
use metrics::counter;
use serde_json::{json, Value};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::dispatch::NotificationDispatcher;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::session::SessionManager;
use crate::token::AuthUser;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Totals from a single maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub refresh_tokens: u64,
    pub notifications: u64,
    pub scheduled: usize,
}

/// Background worker that expires sessions and notifications and releases
/// scheduled notifications once they fall due.
#[derive(Clone)]
pub struct MaintenanceWorker {
    sessions: SessionManager,
    dispatcher: NotificationDispatcher,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(sessions: SessionManager, dispatcher: NotificationDispatcher) -> Self {
        Self {
            sessions,
            dispatcher,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(state.sessions().clone(), state.dispatcher().clone())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.run_once().await;
            info!(
                stage = "maintenance",
                refresh_tokens = report.refresh_tokens,
                notifications = report.notifications,
                scheduled = report.scheduled,
                "maintenance pass completed"
            );
        }
    }

    /// Executes one pass. A failing step is logged and the remaining steps still run.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sessions.cleanup_expired_tokens().await {
            Ok(deleted) => {
                record_ttl("refresh_tokens", deleted);
                report.refresh_tokens = deleted;
            }
            Err(err) => {
                error!(stage = "maintenance", table = "refresh_tokens", error = %err, "ttl sweep failed");
            }
        }

        match self.dispatcher.cleanup_expired().await {
            Ok(deleted) => {
                record_ttl("notifications", deleted);
                report.notifications = deleted;
            }
            Err(err) => {
                error!(stage = "maintenance", table = "notifications", error = %err, "ttl sweep failed");
            }
        }

        match self.dispatcher.deliver_due_scheduled().await {
            Ok(count) => report.scheduled = count,
            Err(err) => {
                error!(stage = "maintenance", error = %err, "scheduled delivery failed");
            }
        }

        report
    }
}

pub(crate) fn record_ttl(table: &'static str, deleted: u64) {
    if deleted == 0 {
        return;
    }
    counter!("db_ttl_deleted_total", "table" => table).increment(deleted);
    info!(stage = "maintenance", table, deleted, "expired rows deleted");
}

/// Runs both TTL sweeps on demand and reports what was removed.
pub async fn cleanup(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    require_role(caller.role, &[Role::Teacher])?;

    let refresh_tokens = state.sessions().cleanup_expired_tokens().await?;
    record_ttl("refresh_tokens", refresh_tokens);
    let notifications = state.dispatcher().cleanup_expired().await?;
    record_ttl("notifications", notifications);

    Ok(Json(json!({
        "refresh_tokens": { "deleted_count": refresh_tokens },
        "notifications": { "deleted_count": notifications },
    })))
}
