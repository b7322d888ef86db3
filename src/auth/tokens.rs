//! Access and refresh token issuance and verification.
//!
//! Both classes are HS256 JWTs signed with their own secret. Access tokens
//! carry the user's role; refresh tokens carry only the subject, so the role
//! is always re-read from the credential store when a new access token is
//! minted.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::Role;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// Bad signature, wrong algorithm, malformed or expired.
    #[error("invalid token")]
    Invalid,

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("token configuration rejected: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Identity recovered from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessIdentity {
    pub user_id: String,
    pub role: Role,
}

/// Secrets and lifetimes, fixed for the life of the process.
#[derive(Clone)]
pub struct TokenConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

pub struct TokenManager {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    validation: Validation,
}

impl TokenManager {
    pub fn new(config: &TokenConfig) -> Result<Self, TokenError> {
        if config.access_secret.is_empty() || config.refresh_secret.is_empty() {
            return Err(TokenError::Misconfigured("signing secrets must not be empty".into()));
        }
        if config.access_secret == config.refresh_secret {
            return Err(TokenError::Misconfigured(
                "access and refresh secrets must differ".into(),
            ));
        }
        if config.access_ttl <= Duration::zero() || config.refresh_ttl <= Duration::zero() {
            return Err(TokenError::Misconfigured("token lifetimes must be positive".into()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            validation,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access(&self, user_id: &str, role: Role) -> Result<String, TokenError> {
        self.issue_access_at(user_id, role, Utc::now())
    }

    pub(crate) fn issue_access_at(
        &self,
        user_id: &str,
        role: Role,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = AccessClaims {
            sub: user_id.to_string(),
            role,
            iat: issued_at.timestamp(),
            exp: (issued_at + self.access_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn issue_refresh(&self, user_id: &str) -> Result<String, TokenError> {
        self.issue_refresh_at(user_id, Utc::now())
    }

    pub(crate) fn issue_refresh_at(
        &self,
        user_id: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = RefreshClaims {
            sub: user_id.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.refresh_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessIdentity, TokenError> {
        let data = decode::<AccessClaims>(token, &self.access_decoding, &self.validation)
            .map_err(|_| TokenError::Invalid)?;

        Ok(AccessIdentity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }

    pub fn verify_refresh(&self, token: &str) -> Result<String, TokenError> {
        let data = decode::<RefreshClaims>(token, &self.refresh_decoding, &self.validation)
            .map_err(|_| TokenError::Invalid)?;

        Ok(data.claims.sub)
    }
}
