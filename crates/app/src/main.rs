mod auth;
mod devices;
mod dispatch;
mod groups;
mod homework;
mod lessons;
mod maintenance;
mod notifications;
mod problem;
mod router;
mod session;
mod telemetry;
mod token;
mod users;

use std::net::SocketAddr;

use classroom_push::{
    http_client, FcmClient, ServiceAccountKey, ServiceAccountTokenSource, TokenSource,
    DEFAULT_REQUEST_TIMEOUT,
};
use classroom_storage::Database;
use classroom_util::{load_env_file, AppConfig, PushConfig, PushCredentials};
use tracing::{info, warn};
use url::Url;

use crate::maintenance::MaintenanceWorker;
use crate::router::Lifetimes;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;
    storage.roles().seed_defaults().await?;

    let push = match &config.push {
        Some(push) => Some(build_push_client(push)?),
        None => {
            warn!(stage = "push", "FCM is not configured; notifications will not be pushed");
            None
        }
    };

    let lifetimes = Lifetimes {
        access_token: chrono::Duration::from_std(config.access_token_ttl)?,
        refresh_token: chrono::Duration::from_std(config.refresh_token_ttl)?,
        notification: chrono::Duration::from_std(config.notification_ttl)?,
    };
    let state = router::AppState::new(
        metrics,
        storage,
        config.jwt_secret.as_bytes(),
        lifetimes,
        push,
    );

    MaintenanceWorker::from_state(&state)
        .with_interval(config.maintenance_interval)
        .spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| err.into())
}

fn build_push_client(config: &PushConfig) -> Result<FcmClient, Box<dyn std::error::Error>> {
    let http = http_client(DEFAULT_REQUEST_TIMEOUT)?;
    let tokens = match &config.credentials {
        PushCredentials::ServiceAccountFile(path) => {
            let key = ServiceAccountKey::from_file(path)?;
            TokenSource::ServiceAccount(ServiceAccountTokenSource::new(key, http.clone())?)
        }
        PushCredentials::StaticToken(token) => TokenSource::Static(token.clone()),
    };
    let base_url = Url::parse(&config.base_url)?;
    info!(stage = "push", project_id = %config.project_id, "FCM push enabled");
    Ok(FcmClient::new(config.project_id.clone(), base_url, tokens, http))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
