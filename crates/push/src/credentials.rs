use std::{path::Path, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Refresh a little before Google expires the token.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Subset of a Google service-account key file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    /// Reads and parses a key file from disk.
    pub fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let raw = std::fs::read_to_string(path).map_err(CredentialsError::Read)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Supplies bearer tokens for the FCM API.
#[derive(Clone)]
pub enum TokenSource {
    /// Token supplied verbatim through configuration.
    Static(String),
    /// OAuth2 JWT-bearer exchange with a cached result.
    ServiceAccount(ServiceAccountTokenSource),
}

impl TokenSource {
    pub async fn access_token(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::ServiceAccount(source) => source.access_token(now).await,
        }
    }
}

/// Exchanges signed service-account assertions for access tokens.
#[derive(Clone)]
pub struct ServiceAccountTokenSource {
    http: Client,
    key: Arc<ServiceAccountKey>,
    encoding_key: Arc<EncodingKey>,
    cache: Arc<Mutex<Option<CachedToken>>>,
}

impl ServiceAccountTokenSource {
    pub fn new(key: ServiceAccountKey, http: Client) -> Result<Self, CredentialsError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        Ok(Self {
            http,
            key: Arc::new(key),
            encoding_key: Arc::new(encoding_key),
            cache: Arc::new(Mutex::new(None)),
        })
    }

    /// Returns a cached token, exchanging a fresh assertion when it is close to expiry.
    pub async fn access_token(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now {
                return Ok(cached.value.clone());
            }
        }

        let assertion = self.sign_assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let token: TokenResponse = parse_json(response).await?;

        tracing::debug!(
            stage = "push",
            expires_in = token.expires_in,
            "obtained fcm access token"
        );
        let value = token.access_token.clone();
        *cache = Some(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        });
        Ok(value)
    }

    fn sign_assertion(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )?)
    }
}

/// Errors raised while obtaining FCM credentials.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read service account file: {0}")]
    Read(std::io::Error),
    #[error("invalid service account json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to sign assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, CredentialsError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(CredentialsError::Status { status, body });
    }

    Ok(response.json().await?)
}
