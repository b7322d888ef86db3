use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

use crate::auth::password::PasswordError;
use crate::auth::session::SessionError;
use crate::auth::tokens::TokenError;
use crate::oauth::OAuthError;

/// Message shared by every 401 so callers cannot tell the failure kinds apart.
const UNAUTHORIZED_MESSAGE: &str = "Invalid or expired credentials";
const INTERNAL_MESSAGE: &str = "Internal server error";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<prometheus::Error> for AppError {
    fn from(err: prometheus::Error) -> Self {
        AppError::Internal(format!("metrics: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid => AppError::Auth(AuthError::InvalidToken),
            TokenError::Signing(msg) => AppError::Internal(msg),
            TokenError::Misconfigured(msg) => AppError::Config(msg),
        }
    }
}

impl From<PasswordError> for AppError {
    fn from(err: PasswordError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => AppError::Auth(AuthError::SessionExpired),
            SessionError::Store(e) => e,
        }
    }
}

impl From<OAuthError> for AppError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::UnknownProvider(name) => {
                AppError::Validation(format!("Unknown identity provider: {}", name))
            }
            OAuthError::MissingEmail => {
                AppError::Validation("Identity provider did not return an email address".into())
            }
            OAuthError::Rejected(_) => AppError::Auth(AuthError::InvalidCredentials),
            OAuthError::Transport(msg) | OAuthError::InvalidResponse(msg) => AppError::Internal(msg),
            OAuthError::Misconfigured(msg) => AppError::Config(msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = json!({
            "error": {
                "message": self.public_message()
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl AppError {
    /// The message sent to clients. Storage, crypto and configuration
    /// details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Auth(AuthError::Forbidden) => "Forbidden: insufficient permissions".into(),
            AppError::Auth(_) => UNAUTHORIZED_MESSAGE.into(),
            AppError::Conflict(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                INTERNAL_MESSAGE.into()
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Session expired or revoked")]
    SessionExpired,

    #[error("User not found")]
    UserNotFound,

    #[error("Forbidden")]
    Forbidden,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Email is already registered")]
    EmailTaken,

    #[error("Username is already taken")]
    UsernameTaken,
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    /// Unique constraint violation; carries the constraint name when known.
    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseError::Duplicate(db_err.constraint().unwrap_or_default().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}
