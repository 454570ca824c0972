use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use classroom_core::{Role, UNKNOWN_DEVICE};
use classroom_storage::{
    Database, NewRefreshToken, NewUser, RefreshTokenError, RefreshTokenRecord,
    RefreshTokenRepository, UserError, UserRecord,
};
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::Sha256;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{info, warn};

use crate::router::Clock;
use crate::token::{AccessTokenCodec, ClientInfo, TokenError};

const REFRESH_TOKEN_BYTES: usize = 64;
const MIN_PASSWORD_LEN: usize = 6;
const SALT_BYTES: usize = 16;
const TTL_BATCH_LIMIT: i64 = 500;

/// Credentials returned by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: UserRecord,
    pub tokens: TokenPair,
}

/// A live refresh token as shown to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: i64,
    pub device_info: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl From<RefreshTokenRecord> for SessionView {
    fn from(record: RefreshTokenRecord) -> Self {
        Self {
            id: record.id,
            device_info: record.device_info,
            ip_address: record.ip_address,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("email is already registered")]
    DuplicateEmail,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("refresh token is not recognised")]
    InvalidRefreshToken,
    #[error("refresh token has been revoked")]
    RevokedRefreshToken,
    #[error("refresh token has expired")]
    ExpiredRefreshToken,
    #[error("session not found")]
    SessionNotFound,
    #[error("default role {0} is missing")]
    MissingRole(Role),
    #[error("refresh token digest key was rejected")]
    DigestKey,
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("refresh token store failed: {0}")]
    Store(#[from] RefreshTokenError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<UserError> for SessionError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::DuplicateEmail => Self::DuplicateEmail,
            UserError::Database(err) => Self::Database(err),
        }
    }
}

/// Issues, rotates and revokes credentials.
///
/// Refresh tokens are opaque random strings. Only their HMAC-SHA256 digest is
/// stored, so a leaked table cannot be replayed against the API.
#[derive(Clone)]
pub struct SessionManager {
    storage: Database,
    tokens: AccessTokenCodec,
    digest_key: Arc<[u8]>,
    refresh_ttl: Duration,
    clock: Clock,
}

impl SessionManager {
    pub fn new(
        storage: Database,
        tokens: AccessTokenCodec,
        digest_key: &[u8],
        refresh_ttl: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            storage,
            tokens,
            digest_key: Arc::from(digest_key),
            refresh_ttl,
            clock,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates a student account. A blank name falls back to the e-mail local part.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, SessionError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(SessionError::InvalidInput("a valid email is required"));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SessionError::InvalidInput(
                "password must be at least 6 characters",
            ));
        }
        let name = match name.trim() {
            "" => email.split('@').next().unwrap_or(email),
            trimmed => trimmed,
        };

        let role = self
            .storage
            .roles()
            .find_by_name(Role::Student)
            .await?
            .ok_or(SessionError::MissingRole(Role::Student))?;
        let password_hash = hash_password(password)?;

        let user = self
            .storage
            .users()
            .insert(&NewUser {
                name,
                email,
                password_hash: &password_hash,
                role_id: role.id,
                created_at: self.now(),
            })
            .await?;

        info!(stage = "auth", user_id = user.id, "account registered");
        Ok(user)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<LoginResult, SessionError> {
        let user = match self.storage.users().find_by_email(email.trim()).await {
            Ok(Some(user)) if verify_password(password, &user.password_hash) => user,
            Ok(_) => {
                counter!("auth_login_total", "result" => "invalid_credentials").increment(1);
                warn!(stage = "auth", "login rejected");
                return Err(SessionError::InvalidCredentials);
            }
            Err(err) => {
                counter!("auth_login_total", "result" => "error").increment(1);
                return Err(err.into());
            }
        };

        let now = self.now();
        let access = self.tokens.issue(&user, now)?;
        let refresh_token = self.create_refresh_token(user.id, client).await?;

        counter!("auth_login_total", "result" => "success").increment(1);
        info!(
            stage = "auth",
            user_id = user.id,
            device = %client.device,
            "login succeeded"
        );

        Ok(LoginResult {
            user,
            tokens: TokenPair {
                access_token: access.token,
                refresh_token,
                token_type: "Bearer",
                expires_in: access.expires_in,
            },
        })
    }

    /// Issues a refresh token for the device, revoking the user's earlier tokens
    /// for the same device label.
    pub async fn create_refresh_token(
        &self,
        user_id: i64,
        client: &ClientInfo,
    ) -> Result<String, SessionError> {
        let repo = self.storage.refresh_tokens();
        let mut tx = repo.begin().await?;
        let token = self
            .issue_refresh_token(&repo, &mut tx, user_id, client, self.now())
            .await?;
        tx.commit().await?;
        Ok(token)
    }

    /// Checks a presented refresh token and records its use.
    pub async fn validate_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenRecord, SessionError> {
        let repo = self.storage.refresh_tokens();
        let mut tx = repo.begin().await?;
        let now = self.now();
        let record = self.find_valid(&repo, &mut tx, token, now).await?;
        repo.touch_last_used(&mut tx, record.id, now).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Exchanges a refresh token for a new access token and a rotated refresh token.
    pub async fn refresh(&self, token: &str) -> Result<TokenPair, SessionError> {
        let result = self.rotate(token).await;
        let label = match &result {
            Ok(_) => "success",
            Err(SessionError::InvalidRefreshToken) => "invalid",
            Err(SessionError::RevokedRefreshToken) => "revoked",
            Err(SessionError::ExpiredRefreshToken) => "expired",
            Err(_) => "error",
        };
        counter!("auth_refresh_total", "result" => label).increment(1);
        result
    }

    async fn rotate(&self, token: &str) -> Result<TokenPair, SessionError> {
        let repo = self.storage.refresh_tokens();
        let mut tx = repo.begin().await?;
        let now = self.now();

        let record = self.find_valid(&repo, &mut tx, token, now).await?;
        let user = self
            .storage
            .users()
            .find_by_id(record.user_id)
            .await?
            .ok_or(SessionError::InvalidRefreshToken)?;
        let access = self.tokens.issue(&user, now)?;

        repo.touch_last_used(&mut tx, record.id, now).await?;
        repo.revoke(&mut tx, record.user_id, record.id, now).await?;
        let client = ClientInfo {
            device: record.device_info.clone(),
            ip: record.ip_address.clone(),
        };
        let refresh_token = self
            .issue_refresh_token(&repo, &mut tx, record.user_id, &client, now)
            .await?;
        tx.commit().await?;

        info!(
            stage = "session",
            user_id = record.user_id,
            session_id = record.id,
            "refresh token rotated"
        );

        Ok(TokenPair {
            access_token: access.token,
            refresh_token,
            token_type: "Bearer",
            expires_in: access.expires_in,
        })
    }

    /// Revokes the presented refresh token. Unknown tokens are ignored.
    pub async fn logout(&self, token: &str) -> Result<bool, SessionError> {
        let revoked = self
            .storage
            .refresh_tokens()
            .revoke_by_digest(&self.digest(token)?, self.now())
            .await?;
        info!(stage = "session", revoked, "logout");
        Ok(revoked)
    }

    pub async fn logout_all(&self, user_id: i64) -> Result<u64, SessionError> {
        let revoked = self
            .storage
            .refresh_tokens()
            .revoke_all_for_user(user_id, self.now())
            .await?;
        info!(stage = "session", user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    /// Revokes one of the caller's sessions; other users' sessions are reported as missing.
    pub async fn revoke_session(&self, user_id: i64, session_id: i64) -> Result<(), SessionError> {
        let repo = self.storage.refresh_tokens();
        let mut tx = repo.begin().await?;
        if !repo.revoke(&mut tx, user_id, session_id, self.now()).await? {
            return Err(SessionError::SessionNotFound);
        }
        tx.commit().await?;
        info!(stage = "session", user_id, session_id, "session revoked");
        Ok(())
    }

    pub async fn active_sessions(&self, user_id: i64) -> Result<Vec<SessionView>, SessionError> {
        let records = self
            .storage
            .refresh_tokens()
            .list_active_for_user(user_id, self.now())
            .await?;
        Ok(records.into_iter().map(SessionView::from).collect())
    }

    /// Deletes expired tokens in bounded batches until none remain.
    pub async fn cleanup_expired_tokens(&self) -> Result<u64, SessionError> {
        let repo = self.storage.refresh_tokens();
        let now = self.now();
        let mut total = 0;
        loop {
            let deleted = repo.delete_expired_batch(now, TTL_BATCH_LIMIT).await?;
            total += deleted;
            if deleted < TTL_BATCH_LIMIT as u64 {
                break;
            }
        }
        Ok(total)
    }

    async fn find_valid(
        &self,
        repo: &RefreshTokenRepository,
        tx: &mut Transaction<'_, Sqlite>,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord, SessionError> {
        let record = repo
            .find_by_digest(tx, &self.digest(token)?)
            .await?
            .ok_or(SessionError::InvalidRefreshToken)?;
        if record.is_revoked {
            warn!(
                stage = "session",
                user_id = record.user_id,
                session_id = record.id,
                "revoked refresh token presented"
            );
            return Err(SessionError::RevokedRefreshToken);
        }
        if record.expires_at < now {
            return Err(SessionError::ExpiredRefreshToken);
        }
        Ok(record)
    }

    async fn issue_refresh_token(
        &self,
        repo: &RefreshTokenRepository,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<String, SessionError> {
        if client.device != UNKNOWN_DEVICE {
            repo.revoke_for_device(tx, user_id, &client.device, now)
                .await?;
        }

        let token = generate_refresh_token();
        repo.insert(
            tx,
            &NewRefreshToken {
                user_id,
                token_digest: &self.digest(&token)?,
                expires_at: now + self.refresh_ttl,
                device_info: &client.device,
                ip_address: &client.ip,
                created_at: now,
            },
        )
        .await?;
        Ok(token)
    }

    fn digest(&self, token: &str) -> Result<String, SessionError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.digest_key)
            .map_err(|_| SessionError::DigestKey)?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(not(test))]
fn hasher() -> Argon2<'static> {
    Argon2::default()
}

// Minimal cost keeps the handler tests fast; verification reads the
// parameters back from the stored PHC string.
#[cfg(test)]
fn hasher() -> Argon2<'static> {
    let params = argon2::Params::new(8, 1, 1, None).expect("argon2 params");
    Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
}

fn hash_password(password: &str) -> Result<String, SessionError> {
    let mut salt = [0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut salt);
    let salt =
        SaltString::encode_b64(&salt).map_err(|err| SessionError::PasswordHash(err.to_string()))?;
    hasher()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| SessionError::PasswordHash(err.to_string()))
}

fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            hasher()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::{setup_database, JWT_SECRET};
    use std::sync::Mutex;

    fn client(device: &str) -> ClientInfo {
        ClientInfo {
            device: device.into(),
            ip: "198.51.100.4".into(),
        }
    }

    fn manager(database: Database, clock: Clock) -> SessionManager {
        SessionManager::new(
            database,
            AccessTokenCodec::new(JWT_SECRET, Duration::seconds(1800)),
            JWT_SECRET,
            Duration::days(30),
            clock,
        )
    }

    fn movable_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, Clock) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().expect("clock poisoned"));
        (now, clock)
    }

    #[tokio::test]
    async fn register_validates_and_hashes() {
        let sessions = manager(setup_database().await, Arc::new(Utc::now));

        let err = sessions.register("a", "not-an-email", "secret1").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        let err = sessions.register("a", "a@example.com", "12345").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));

        let user = sessions
            .register("", "ada@example.com", "secret1")
            .await
            .expect("register");
        assert_eq!(user.name, "ada");
        assert_eq!(user.role, Role::Student);
        assert_ne!(user.password_hash, "secret1");
        assert!(user.password_hash.starts_with("$argon2id$"));

        let err = sessions
            .register("Ada", "ADA@example.com", "secret1")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateEmail));
    }

    #[tokio::test]
    async fn login_rejects_unknown_user_and_bad_password_alike() {
        let sessions = manager(setup_database().await, Arc::new(Utc::now));
        sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();

        let unknown = sessions
            .login("nobody@example.com", "secret1", &client("Mac"))
            .await
            .unwrap_err();
        let wrong = sessions
            .login("ada@example.com", "wrong-pass", &client("Mac"))
            .await
            .unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());

        let result = sessions
            .login("ada@example.com", "secret1", &client("Mac"))
            .await
            .expect("login");
        assert_eq!(result.tokens.token_type, "Bearer");
        assert_eq!(result.tokens.expires_in, 1800);
        assert_eq!(result.tokens.refresh_token.len(), 128);
    }

    #[tokio::test]
    async fn only_the_digest_is_stored() {
        let database = setup_database().await;
        let sessions = manager(database.clone(), Arc::new(Utc::now));
        sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();
        let result = sessions
            .login("ada@example.com", "secret1", &client("Mac"))
            .await
            .unwrap();

        let stored: Vec<String> = sqlx::query_scalar("SELECT token_digest FROM refresh_tokens")
            .fetch_all(database.pool())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0], result.tokens.refresh_token);
        assert_eq!(stored[0], sessions.digest(&result.tokens.refresh_token).unwrap());
    }

    #[tokio::test]
    async fn new_login_on_same_device_revokes_previous_token() {
        let sessions = manager(setup_database().await, Arc::new(Utc::now));
        let user = sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();

        let first = sessions.create_refresh_token(user.id, &client("Mac")).await.unwrap();
        let _phone = sessions
            .create_refresh_token(user.id, &client("Mobile Device"))
            .await
            .unwrap();
        let _second = sessions.create_refresh_token(user.id, &client("Mac")).await.unwrap();

        let err = sessions.validate_refresh_token(&first).await.unwrap_err();
        assert!(matches!(err, SessionError::RevokedRefreshToken));
        assert_eq!(sessions.active_sessions(user.id).await.unwrap().len(), 2);

        // Unidentified clients never displace each other.
        sessions
            .create_refresh_token(user.id, &client(UNKNOWN_DEVICE))
            .await
            .unwrap();
        sessions
            .create_refresh_token(user.id, &client(UNKNOWN_DEVICE))
            .await
            .unwrap();
        assert_eq!(sessions.active_sessions(user.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn refresh_rotates_and_revokes_presented_token() {
        let sessions = manager(setup_database().await, Arc::new(Utc::now));
        let user = sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();
        let original = sessions.create_refresh_token(user.id, &client("Mac")).await.unwrap();

        let pair = sessions.refresh(&original).await.expect("refresh");
        assert_ne!(pair.refresh_token, original);
        assert_eq!(pair.token_type, "Bearer");

        let err = sessions.refresh(&original).await.unwrap_err();
        assert!(matches!(err, SessionError::RevokedRefreshToken));

        let active = sessions.active_sessions(user.id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_info, "Mac");
        assert_eq!(active[0].ip_address, "198.51.100.4");

        let err = sessions.refresh("deadbeef").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRefreshToken));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected_and_cleaned_up() {
        let start = Utc::now();
        let (now, clock) = movable_clock(start);
        let sessions = manager(setup_database().await, clock);
        let user = sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();
        let token = sessions.create_refresh_token(user.id, &client("Mac")).await.unwrap();

        let record = sessions.validate_refresh_token(&token).await.unwrap();
        assert_eq!(record.user_id, user.id);

        *now.lock().unwrap() = start + Duration::days(31);
        let err = sessions.refresh(&token).await.unwrap_err();
        assert!(matches!(err, SessionError::ExpiredRefreshToken));
        assert!(sessions.active_sessions(user.id).await.unwrap().is_empty());

        assert_eq!(sessions.cleanup_expired_tokens().await.unwrap(), 1);
        let err = sessions.validate_refresh_token(&token).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRefreshToken));
    }

    #[tokio::test]
    async fn logout_variants_revoke_sessions() {
        let sessions = manager(setup_database().await, Arc::new(Utc::now));
        let ada = sessions
            .register("Ada", "ada@example.com", "secret1")
            .await
            .unwrap();
        let bob = sessions
            .register("Bob", "bob@example.com", "secret1")
            .await
            .unwrap();

        let token = sessions.create_refresh_token(ada.id, &client("Mac")).await.unwrap();
        assert!(sessions.logout(&token).await.unwrap());
        assert!(!sessions.logout(&token).await.unwrap());
        assert!(!sessions.logout("unknown").await.unwrap());

        sessions.create_refresh_token(ada.id, &client("Mac")).await.unwrap();
        sessions.create_refresh_token(ada.id, &client("Tablet")).await.unwrap();
        assert_eq!(sessions.logout_all(ada.id).await.unwrap(), 2);

        sessions.create_refresh_token(bob.id, &client("Mac")).await.unwrap();
        let bob_session = sessions.active_sessions(bob.id).await.unwrap()[0].id;
        let err = sessions.revoke_session(ada.id, bob_session).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound));

        sessions.revoke_session(bob.id, bob_session).await.unwrap();
        assert!(sessions.active_sessions(bob.id).await.unwrap().is_empty());
    }
}
