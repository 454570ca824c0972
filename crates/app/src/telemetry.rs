use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::describe_counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use classroom_util::{AppConfig, Environment};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Counters exported at `/metrics`, with their help text.
const COUNTERS: &[(&str, &str)] = &[
    ("auth_login_total", "Login attempts, labelled by result"),
    ("auth_refresh_total", "Refresh-token exchanges, labelled by result"),
    ("notifications_created_total", "Notifications persisted, labelled by type"),
    ("notification_recipients_total", "Recipient rows created by fan-out"),
    ("push_delivery_total", "Push delivery attempts, labelled by result"),
    ("db_ttl_deleted_total", "Rows removed by TTL sweeps, labelled by table"),
];

static TRACING_READY: OnceLock<()> = OnceLock::new();
static RECORDER: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to install prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

/// Installs the global subscriber: pretty output while developing, JSON lines in
/// production. Later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (pretty, json) = match config.environment {
        Environment::Production => (
            None,
            Some(
                tracing_fmt::layer()
                    .with_target(false)
                    .with_timer(UtcTime::rfc_3339())
                    .json(),
            ),
        ),
        Environment::Development | Environment::Test => (
            Some(
                tracing_fmt::layer()
                    .with_target(false)
                    .with_timer(UtcTime::rfc_3339())
                    .pretty(),
            ),
            None,
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()?;

    TRACING_READY.set(()).ok();
    tracing::info!(
        stage = "app",
        env = %config.environment.as_str(),
        version = SERVICE_VERSION,
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once and returns a handle to it.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = RECORDER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    STARTED_AT.get_or_init(Instant::now);
    *slot = Some(handle.clone());
    Ok(handle)
}

/// Renders the recorder plus the service version and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|started| started.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\napp_build_info{{version=\"{SERVICE_VERSION}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\napp_uptime_seconds {uptime}\n"
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_appends_version_and_uptime() {
        let handle = init_metrics().expect("metrics");
        metrics::counter!("auth_login_total", "result" => "success").increment(1);

        let body = render_metrics(&handle);
        assert!(body.contains("auth_login_total"));
        assert!(body.contains(&format!("app_build_info{{version=\"{SERVICE_VERSION}\"}} 1")));
        assert!(body.contains("app_uptime_seconds "));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn init_metrics_is_idempotent() {
        init_metrics().expect("first");
        init_metrics().expect("second");
        assert!(STARTED_AT.get().is_some());
    }
}
