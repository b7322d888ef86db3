//! Request authorization gate.
//!
//! [`AuthContext`] is an actix extractor that verifies the bearer access token
//! with the shared [`TokenManager`]. It never touches storage. Handlers that
//! take an `AuthContext` are reachable only with a valid token.
//!
//! ```ignore
//! async fn orders(ctx: AuthContext) -> Result<HttpResponse, AppError> {
//!     tracing::info!(user_id = %ctx.user_id, role = %ctx.role, "listing orders");
//!     Ok(HttpResponse::Ok().finish())
//! }
//! ```

use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};

use crate::auth::tokens::TokenManager;
use crate::db::models::Role;
use crate::error::{AppError, AuthError};

/// Identity attached to an authorized request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Role,
}

impl AuthContext {
    /// Rejects with 403 unless the caller holds `role`.
    pub fn require_role(&self, role: Role) -> Result<(), AppError> {
        if self.role != role {
            return Err(AuthError::Forbidden.into());
        }
        Ok(())
    }

    fn from_http_request(req: &HttpRequest) -> Result<Self, AppError> {
        let tokens = req
            .app_data::<web::Data<TokenManager>>()
            .ok_or_else(|| AppError::Internal("token manager not registered".into()))?;

        let token = bearer_token(req).ok_or(AuthError::InvalidToken)?;
        let identity = tokens.verify_access(token)?;

        Ok(AuthContext {
            user_id: identity.user_id,
            role: identity.role,
        })
    }
}

/// The token from `Authorization: Bearer <token>`; the scheme is matched
/// case-insensitively.
pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

impl FromRequest for AuthContext {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Self::from_http_request(req))
    }
}

/// Requires the `admin` role. Rejects with 403 Forbidden otherwise.
pub struct RequireAdmin(pub AuthContext);

impl FromRequest for RequireAdmin {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = AuthContext::from_http_request(req).and_then(|ctx| {
            ctx.require_role(Role::Admin)?;
            Ok(RequireAdmin(ctx))
        });
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::TokenConfig;
    use actix_web::http::StatusCode;
    use actix_web::test::{call_service, init_service, TestRequest};
    use actix_web::{App, HttpResponse};
    use chrono::Duration;

    fn manager() -> TokenManager {
        TokenManager::new(&TokenConfig {
            access_secret: "gate-access-secret".into(),
            refresh_secret: "gate-refresh-secret".into(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        })
        .unwrap()
    }

    #[actix_web::test]
    async fn test_extracts_identity_from_bearer() {
        let tokens = manager();
        let token = tokens.issue_access("user-1", Role::User).unwrap();
        let req = TestRequest::default()
            .app_data(web::Data::new(tokens))
            .insert_header((AUTHORIZATION, format!("bearer {}", token)))
            .to_http_request();

        let ctx = AuthContext::extract(&req).await.unwrap();
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.role, Role::User);
    }

    #[actix_web::test]
    async fn test_missing_or_malformed_header_is_invalid_token() {
        for header in [None, Some("Basic abc"), Some("Bearer "), Some("Bearer not-a-jwt")] {
            let mut req = TestRequest::default().app_data(web::Data::new(manager()));
            if let Some(value) = header {
                req = req.insert_header((AUTHORIZATION, value));
            }
            let err = AuthContext::extract(&req.to_http_request()).await.unwrap_err();
            assert!(matches!(err, AppError::Auth(AuthError::InvalidToken)), "{:?}", header);
        }
    }

    #[actix_web::test]
    async fn test_refresh_token_is_not_a_bearer() {
        let tokens = manager();
        let refresh = tokens.issue_refresh("user-1").unwrap();
        let req = TestRequest::default()
            .app_data(web::Data::new(tokens))
            .insert_header((AUTHORIZATION, format!("Bearer {}", refresh)))
            .to_http_request();

        assert!(AuthContext::extract(&req).await.is_err());
    }

    #[test]
    fn test_require_role() {
        let ctx = AuthContext {
            user_id: "user-1".into(),
            role: Role::User,
        };
        assert!(ctx.require_role(Role::User).is_ok());
        assert!(matches!(
            ctx.require_role(Role::Admin),
            Err(AppError::Auth(AuthError::Forbidden))
        ));
    }

    #[actix_web::test]
    async fn test_admin_route_statuses() {
        let tokens = manager();
        let admin = tokens.issue_access("admin-1", Role::Admin).unwrap();
        let user = tokens.issue_access("user-1", Role::User).unwrap();

        let app = init_service(
            App::new().app_data(web::Data::new(tokens)).route(
                "/admin",
                web::get().to(|RequireAdmin(ctx): RequireAdmin| async move {
                    HttpResponse::Ok().body(ctx.user_id)
                }),
            ),
        )
        .await;

        let cases = [
            (Some(admin), StatusCode::OK),
            (Some(user), StatusCode::FORBIDDEN),
            (None, StatusCode::UNAUTHORIZED),
        ];
        for (token, expected) in cases {
            let mut req = TestRequest::get().uri("/admin");
            if let Some(token) = token {
                req = req.insert_header((AUTHORIZATION, format!("Bearer {}", token)));
            }
            let resp = call_service(&app, req.to_request()).await;
            assert_eq!(resp.status(), expected);
        }
    }
}
