//! Authentication flows: register, login, refresh, logout, identify and
//! identity-provider login.
//!
//! Every failure leaving this module is one of the [`AppError`] kinds; store
//! and crypto details are logged, not returned.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::auth::password::PasswordHasher;
use crate::auth::session::SessionRegistry;
use crate::auth::tokens::TokenManager;
use crate::db::models::{User, UserProfile};
use crate::db::store::{SessionStore, UserStore, EMAIL_CONSTRAINT, USERNAME_CONSTRAINT};
use crate::error::{AppError, AuthError, ConflictError, DatabaseError};
use crate::metrics::Metrics;
use crate::oauth::OAuthIdentity;
use crate::Result;

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const USERNAME_ATTEMPTS: usize = 5;

#[derive(Clone, Deserialize, Validate)]
pub struct RegisterInput {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
    #[validate(length(min = 3, max = 32, message = "username must be 3 to 32 characters"))]
    pub username: String,
    #[validate(length(min = 6, max = 256, message = "password must be at least 6 characters"))]
    pub password: String,
}

impl RegisterInput {
    fn normalized(self) -> Self {
        Self {
            email: normalize_email(&self.email),
            username: self.username.trim().to_string(),
            password: self.password,
        }
    }
}

/// Where a login came from; stored on the session row.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: String,
    pub ip_address: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Builds a username candidate for an identity-provider account.
fn derive_username(display_name: &str, email: &str) -> String {
    let sanitize = |raw: &str| -> String {
        raw.trim()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c.to_ascii_lowercase() })
            .filter(|c| is_username_char(*c))
            .take(USERNAME_MAX - 5)
            .collect()
    };

    let from_name = sanitize(display_name);
    if from_name.len() >= USERNAME_MIN {
        return from_name;
    }
    let local_part = email.split('@').next().unwrap_or_default();
    let from_email = sanitize(local_part);
    if from_email.len() >= USERNAME_MIN {
        return from_email;
    }
    "user".to_string()
}

fn map_duplicate(err: AppError) -> AppError {
    match err {
        AppError::Database(DatabaseError::Duplicate(ref c)) if c == EMAIL_CONSTRAINT => {
            ConflictError::EmailTaken.into()
        }
        AppError::Database(DatabaseError::Duplicate(ref c)) if c == USERNAME_CONSTRAINT => {
            ConflictError::UsernameTaken.into()
        }
        other => other,
    }
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: SessionRegistry,
    tokens: Arc<TokenManager>,
    hasher: PasswordHasher,
    /// Verified against when the account does not exist, so unknown users
    /// cost the same as wrong passwords.
    dummy_hash: String,
    metrics: Arc<Metrics>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<TokenManager>,
        hasher: PasswordHasher,
    ) -> Result<Self> {
        let dummy_hash = hasher.unusable_hash()?;
        Ok(Self {
            users,
            sessions: SessionRegistry::new(sessions, tokens.refresh_ttl()),
            tokens,
            hasher,
            dummy_hash,
            metrics: Arc::new(Metrics::new()?),
        })
    }

    /// Reports into `metrics` instead of a private registry.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn hash_password(&self, password: String) -> Result<String> {
        let hasher = self.hasher.clone();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))??;
        Ok(hash)
    }

    async fn verify_password(&self, hash: String, password: String) -> Result<bool> {
        let hasher = self.hasher.clone();
        let matches = tokio::task::spawn_blocking(move || hasher.verify(&hash, &password))
            .await
            .map_err(|e| AppError::Internal(format!("verification task failed: {}", e)))??;
        Ok(matches)
    }

    pub async fn register(&self, input: RegisterInput) -> Result<UserProfile> {
        let input = input.normalized();
        input.validate()?;
        if !input.username.chars().all(is_username_char) {
            return Err(AppError::Validation(
                "username may contain only letters, digits, '_', '.' and '-'".into(),
            ));
        }

        // Advisory only; the unique constraints decide races.
        if self.users.get_user_by_email(&input.email).await?.is_some() {
            return Err(ConflictError::EmailTaken.into());
        }
        if self.users.get_user_by_username(&input.username).await?.is_some() {
            return Err(ConflictError::UsernameTaken.into());
        }

        let password_hash = self.hash_password(input.password).await?;
        let user = User::new(input.email, input.username, password_hash);
        let created = self.users.create_user(&user).await.map_err(map_duplicate)?;

        self.metrics.register.inc();
        info!(user_id = %created.id, "user registered");
        Ok(created.profile())
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        let identifier = identifier.trim();
        if identifier.contains('@') {
            self.users.get_user_by_email(&normalize_email(identifier)).await
        } else {
            self.users.get_user_by_username(identifier).await
        }
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<LoginOutcome> {
        if identifier.trim().is_empty() || password.is_empty() {
            return Err(AppError::Validation("identifier and password are required".into()));
        }

        let user = self.find_by_identifier(identifier).await?;
        let hash = match &user {
            Some(u) => u.password_hash.clone(),
            None => self.dummy_hash.clone(),
        };
        let password_ok = self.verify_password(hash, password.to_string()).await?;

        let user = match user {
            Some(user) if password_ok => user,
            _ => {
                self.metrics.login_failed.inc();
                debug!("login rejected");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let outcome = self.open_session(&user, client).await?;
        self.metrics.login_success.inc();
        info!(user_id = %user.id, "user logged in");
        Ok(outcome)
    }

    async fn open_session(&self, user: &User, client: &ClientInfo) -> Result<LoginOutcome> {
        let access_token = self.tokens.issue_access(&user.id, user.role)?;
        let refresh_token = self.tokens.issue_refresh(&user.id)?;
        let session = self
            .sessions
            .open(&user.id, &refresh_token, &client.user_agent, &client.ip_address)
            .await?;

        Ok(LoginOutcome {
            user: user.profile(),
            access_token,
            refresh_token,
            refresh_expires_at: session.expires_at,
        })
    }

    /// Mints a new access token. The refresh token and its session are left
    /// as they are; the role comes from the store, not the token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let user_id = self.tokens.verify_refresh(refresh_token)?;
        self.sessions.validate(&user_id, refresh_token).await?;

        let user = self
            .users
            .get_user_by_id(&user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        debug!(user_id = %user.id, "access token refreshed");
        Ok(self.tokens.issue_access(&user.id, user.role)?)
    }

    /// Always succeeds and never reveals whether a session existed.
    pub async fn logout(&self, refresh_token: Option<&str>) {
        let Some(token) = refresh_token else {
            return;
        };
        if let Err(e) = self.sessions.revoke(token).await {
            warn!(error = %e, "failed to revoke session on logout");
        }
    }

    /// Revokes every session of `user_id`, signing out all devices.
    pub async fn logout_all(&self, user_id: &str) -> Result<u64> {
        let revoked = self.sessions.revoke_all(user_id).await?;
        info!(user_id = %user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    pub async fn identify(&self, access_token: &str) -> Result<UserProfile> {
        let identity = self.tokens.verify_access(access_token)?;
        self.profile(&identity.user_id).await
    }

    pub async fn profile(&self, user_id: &str) -> Result<UserProfile> {
        let user = self
            .users
            .get_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        Ok(user.profile())
    }

    /// Signs in a user vouched for by an identity provider, creating the
    /// account on first sight.
    pub async fn oauth_login(
        &self,
        identity: &OAuthIdentity,
        client: &ClientInfo,
    ) -> Result<LoginOutcome> {
        let email = normalize_email(&identity.email);
        if !email.contains('@') {
            return Err(AppError::Validation("identity provider returned an invalid email".into()));
        }

        let user = match self.users.get_user_by_email(&email).await? {
            Some(user) => user,
            None => self.create_oauth_user(&email, &identity.display_name).await?,
        };

        let outcome = self.open_session(&user, client).await?;
        self.metrics.oauth_login.inc();
        info!(user_id = %user.id, provider = %identity.provider, "user logged in via identity provider");
        Ok(outcome)
    }

    async fn create_oauth_user(&self, email: &str, display_name: &str) -> Result<User> {
        let hasher = self.hasher.clone();
        let password_hash = tokio::task::spawn_blocking(move || hasher.unusable_hash())
            .await
            .map_err(|e| AppError::Internal(format!("hashing task failed: {}", e)))??;

        let base = derive_username(display_name, email);
        for attempt in 0..USERNAME_ATTEMPTS {
            let username = if attempt == 0 {
                base.clone()
            } else {
                let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
                format!("{}_{}", base, suffix)
            };

            let user = User::new(email.to_string(), username, password_hash.clone());
            match self.users.create_user(&user).await.map_err(map_duplicate) {
                Ok(created) => {
                    info!(user_id = %created.id, "user created from identity provider");
                    return Ok(created);
                }
                Err(AppError::Conflict(ConflictError::UsernameTaken)) => continue,
                Err(AppError::Conflict(ConflictError::EmailTaken)) => {
                    // A concurrent request created the account first.
                    return self
                        .users
                        .get_user_by_email(email)
                        .await?
                        .ok_or_else(|| AppError::Internal("user vanished after email conflict".into()));
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal("could not allocate a unique username".into()))
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        Ok(self.sessions.purge_expired().await?)
    }
}
