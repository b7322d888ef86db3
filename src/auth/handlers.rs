use actix_web::cookie::time::{Duration as CookieDuration, OffsetDateTime};
use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header::{LOCATION, USER_AGENT};
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::middleware::AuthContext;
use crate::auth::service::{ClientInfo, LoginOutcome, RegisterInput};
use crate::db::models::UserProfile;
use crate::error::{AppError, AuthError};
use crate::oauth::{OAuthClient, OAuthError};
use crate::AppState;

pub const REFRESH_COOKIE: &str = "refresh_token";
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
const OAUTH_STATE_TTL_MINUTES: i64 = 10;

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Email or username.
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn client_info(req: &HttpRequest) -> ClientInfo {
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let ip_address = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or_default()
        .to_string();
    ClientInfo { user_agent, ip_address }
}

fn refresh_cookie(token: String, expires_at: DateTime<Utc>) -> Result<Cookie<'static>, AppError> {
    let expires = OffsetDateTime::from_unix_timestamp(expires_at.timestamp())
        .map_err(|e| AppError::Internal(format!("cookie expiry out of range: {}", e)))?;
    Ok(Cookie::build(REFRESH_COOKIE, token)
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .expires(expires)
        .finish())
}

/// Same attributes as the refresh cookie, already expired.
fn cleared_refresh_cookie() -> Cookie<'static> {
    Cookie::build(REFRESH_COOKIE, "")
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .expires(OffsetDateTime::UNIX_EPOCH)
        .max_age(CookieDuration::ZERO)
        .finish()
}

// Lax: the provider's redirect back is a cross-site navigation.
fn oauth_state_cookie(value: String, max_age: CookieDuration) -> Cookie<'static> {
    Cookie::build(OAUTH_STATE_COOKIE, value)
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .finish()
}

fn session_response(outcome: LoginOutcome) -> Result<HttpResponse, AppError> {
    let cookie = refresh_cookie(outcome.refresh_token, outcome.refresh_expires_at)?;
    Ok(HttpResponse::Ok().cookie(cookie).json(LoginResponse {
        access_token: outcome.access_token,
        user: outcome.user,
    }))
}

pub async fn register(
    body: web::Json<RegisterInput>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let profile = state.auth_service.register(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(profile))
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let client = client_info(&req);
    let outcome = state
        .auth_service
        .login(&body.identifier, &body.password, &client)
        .await?;
    session_response(outcome)
}

pub async fn refresh(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let cookie = req.cookie(REFRESH_COOKIE).ok_or(AuthError::InvalidToken)?;
    let access_token = state.auth_service.refresh(cookie.value()).await?;
    Ok(HttpResponse::Ok().json(AccessTokenResponse { access_token }))
}

pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let token = req.cookie(REFRESH_COOKIE).map(|c| c.value().to_string());
    state.auth_service.logout(token.as_deref()).await;

    HttpResponse::Ok()
        .cookie(cleared_refresh_cookie())
        .json(serde_json::json!({
            "message": "Successfully logged out"
        }))
}

pub async fn logout_all(
    ctx: AuthContext,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let revoked = state.auth_service.logout_all(&ctx.user_id).await?;
    Ok(HttpResponse::Ok()
        .cookie(cleared_refresh_cookie())
        .json(serde_json::json!({
            "message": "Logged out from all devices",
            "revoked": revoked
        })))
}

pub async fn me(ctx: AuthContext, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let profile = state.auth_service.profile(&ctx.user_id).await?;
    Ok(HttpResponse::Ok().json(profile))
}

pub async fn oauth_start(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let provider = path.into_inner().to_lowercase();
    let csrf_state = OAuthClient::new_state();
    let location = state.oauth.authorize_url(&provider, &csrf_state)?;

    info!(provider = %provider, "redirecting to identity provider");
    Ok(HttpResponse::Found()
        .insert_header((LOCATION, location))
        .cookie(oauth_state_cookie(
            bound_state(&provider, &csrf_state),
            CookieDuration::minutes(OAUTH_STATE_TTL_MINUTES),
        ))
        .finish())
}

/// Cookie value for a flow: the state only matches on the provider's own
/// callback.
fn bound_state(provider: &str, csrf_state: &str) -> String {
    format!("{}:{}", provider, csrf_state)
}

/// Completes an identity-provider login. The state cookie is single use and
/// is cleared whatever the outcome.
pub async fn oauth_callback(
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<OAuthCallbackQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let provider = path.into_inner().to_lowercase();
    let mut response = match complete_oauth(&req, &provider, query.into_inner(), &state).await {
        Ok(response) => response,
        Err(err) => err.error_response(),
    };
    response
        .add_cookie(&oauth_state_cookie(String::new(), CookieDuration::ZERO))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(response)
}

async fn complete_oauth(
    req: &HttpRequest,
    provider: &str,
    query: OAuthCallbackQuery,
    state: &AppState,
) -> Result<HttpResponse, AppError> {
    if let Some(error) = query.error {
        return Err(OAuthError::Rejected(error).into());
    }
    let (Some(code), Some(returned_state)) = (query.code, query.state) else {
        return Err(AppError::Validation("code and state are required".into()));
    };

    let expected_state = req.cookie(OAUTH_STATE_COOKIE).map(|c| c.value().to_string());
    if expected_state != Some(bound_state(provider, &returned_state)) {
        warn!(provider = %provider, "identity provider callback with mismatched state");
        return Err(AuthError::InvalidCredentials.into());
    }

    let identity = state.oauth.exchange_code(provider, &code).await?;
    let outcome = state
        .auth_service
        .oauth_login(&identity, &client_info(req))
        .await?;
    session_response(outcome)
}
