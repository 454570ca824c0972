use std::{env, fmt, net::SocketAddr, path::PathBuf, time::Duration};

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://classroom.db?mode=rwc";
const DEVELOPMENT_JWT_SECRET: &str = "classroom-development-secret-do-not-deploy";
const MIN_PRODUCTION_SECRET_LEN: usize = 32;
const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 1800;
const DEFAULT_REFRESH_TOKEN_TTL_DAYS: u64 = 30;
const DEFAULT_NOTIFICATION_TTL_DAYS: u64 = 30;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;
const DEFAULT_FCM_BASE_URL: &str = "https://fcm.googleapis.com/";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const MAX_ACCESS_TOKEN_TTL_SECS: u64 = 7 * SECONDS_PER_DAY;
const MAX_RETENTION_DAYS: u64 = 3650;
const MAX_MAINTENANCE_INTERVAL_SECS: u64 = SECONDS_PER_DAY;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How the push client authenticates against FCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCredentials {
    /// Path to a Google service-account JSON key.
    ServiceAccountFile(PathBuf),
    /// Pre-minted OAuth bearer token, mostly useful for local testing.
    StaticToken(String),
}

/// Push delivery settings. Absent when push is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    pub project_id: String,
    pub base_url: String,
    pub credentials: PushCredentials,
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub notification_ttl: Duration,
    pub maintenance_interval: Duration,
    pub push: Option<PushConfig>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url = non_empty_var("DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let jwt_secret = resolve_jwt_secret(environment)?;

        let access_token_ttl = Duration::from_secs(bounded_u64(
            "ACCESS_TOKEN_TTL_SECS",
            DEFAULT_ACCESS_TOKEN_TTL_SECS,
            MAX_ACCESS_TOKEN_TTL_SECS,
        )?);
        let refresh_token_ttl = days(bounded_u64(
            "REFRESH_TOKEN_TTL_DAYS",
            DEFAULT_REFRESH_TOKEN_TTL_DAYS,
            MAX_RETENTION_DAYS,
        )?);
        let notification_ttl = days(bounded_u64(
            "NOTIFICATION_TTL_DAYS",
            DEFAULT_NOTIFICATION_TTL_DAYS,
            MAX_RETENTION_DAYS,
        )?);
        let maintenance_interval = Duration::from_secs(bounded_u64(
            "MAINTENANCE_INTERVAL_SECS",
            DEFAULT_MAINTENANCE_INTERVAL_SECS,
            MAX_MAINTENANCE_INTERVAL_SECS,
        )?);

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            jwt_secret,
            access_token_ttl,
            refresh_token_ttl,
            notification_ttl,
            maintenance_interval,
            push: resolve_push()?,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads an integer in `1..=max`, falling back to `default` when unset.
fn bounded_u64(name: &'static str, default: u64, max: u64) -> Result<u64, ConfigError> {
    let Some(raw) = non_empty_var(name) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(value) if (1..=max).contains(&value) => Ok(value),
        _ => Err(ConfigError::InvalidNumber {
            name,
            value: raw,
            max,
        }),
    }
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(SECONDS_PER_DAY))
}

fn resolve_jwt_secret(environment: Environment) -> Result<String, ConfigError> {
    match (non_empty_var("JWT_SECRET"), environment) {
        (Some(secret), Environment::Production) if secret.len() < MIN_PRODUCTION_SECRET_LEN => {
            Err(ConfigError::WeakSecret(MIN_PRODUCTION_SECRET_LEN))
        }
        (Some(secret), _) => Ok(secret),
        (None, Environment::Production) => Err(ConfigError::MissingSecret),
        (None, _) => Ok(DEVELOPMENT_JWT_SECRET.to_string()),
    }
}

fn resolve_push() -> Result<Option<PushConfig>, ConfigError> {
    let project_id = non_empty_var("FCM_PROJECT_ID");
    let credentials = match (
        non_empty_var("FCM_CREDENTIALS_FILE"),
        non_empty_var("FCM_ACCESS_TOKEN"),
    ) {
        (Some(path), _) => Some(PushCredentials::ServiceAccountFile(PathBuf::from(path))),
        (None, Some(token)) => Some(PushCredentials::StaticToken(token)),
        (None, None) => None,
    };

    match (project_id, credentials) {
        (None, None) => Ok(None),
        (Some(project_id), Some(credentials)) => Ok(Some(PushConfig {
            project_id,
            base_url: non_empty_var("FCM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_FCM_BASE_URL.to_string()),
            credentials,
        })),
        (Some(_), None) => Err(ConfigError::IncompletePush(
            "FCM_CREDENTIALS_FILE or FCM_ACCESS_TOKEN",
        )),
        (None, Some(_)) => Err(ConfigError::IncompletePush("FCM_PROJECT_ID")),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber {
        name: &'static str,
        value: String,
        max: u64,
    },
    MissingSecret,
    WeakSecret(usize),
    IncompletePush(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { name, value, max } => {
                write!(f, "{name} must be an integer between 1 and {max} (got {value})")
            }
            Self::MissingSecret => write!(f, "JWT_SECRET must be set in production"),
            Self::WeakSecret(min) => {
                write!(f, "JWT_SECRET must be at least {min} bytes in production")
            }
            Self::IncompletePush(missing) => {
                write!(f, "push notifications are partially configured: {missing} is missing")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
