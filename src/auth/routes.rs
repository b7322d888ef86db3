use actix_web::web;

use crate::auth::handlers;
use crate::error::AppError;

const JSON_LIMIT: usize = 16 * 1024;

/// Mounts the `/auth` routes. Malformed bodies and query strings are
/// answered with the usual error payload.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(JSON_LIMIT)
            .error_handler(|err, _req| AppError::Validation(format!("Invalid request body: {}", err)).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::Validation(format!("Invalid query: {}", err)).into()),
    )
    .service(
        web::scope("/auth")
            .route("/register", web::post().to(handlers::register))
            .route("/login", web::post().to(handlers::login))
            .route("/refresh", web::post().to(handlers::refresh))
            .route("/logout", web::post().to(handlers::logout))
            .route("/logout-all", web::post().to(handlers::logout_all))
            .route("/me", web::get().to(handlers::me))
            .route("/oauth/{provider}", web::get().to(handlers::oauth_start))
            .route("/oauth/{provider}/callback", web::get().to(handlers::oauth_callback)),
    );
}
