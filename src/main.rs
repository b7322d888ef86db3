use actix_cors::Cors;
use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use std::net::TcpListener;
use std::time::Duration;
use storefront_auth::metrics::{metrics_handler, track_requests};
use storefront_auth::{auth, health_check, AppError, AppState, Settings};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn build_cors(config: &Settings) -> Cors {
    if !config.cors.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.cors.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        config
            .cors
            .origins()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec!["Authorization", "Content-Type"])
    };

    // Refresh cookies cross the origin boundary.
    cors.supports_credentials().max_age(config.cors.max_age as usize)
}

fn spawn_session_sweeper(state: web::Data<AppState>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            match state.auth_service.purge_expired_sessions().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "expired sessions removed"),
                Err(e) => error!(error = %e, "expired session sweep failed"),
            }
        }
    });
}

#[actix_web::main]
async fn main() -> storefront_auth::Result<()> {
    // Load environment variables
    dotenv().ok();

    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    let state = if config.database.url.starts_with("memory") {
        warn!("Using in-memory credential store; data is lost on restart");
        AppState::in_memory(config.clone())?
    } else {
        AppState::new(config.clone()).await?
    };
    let state = web::Data::new(state);
    let tokens = web::Data::from(state.tokens.clone());
    let metrics = web::Data::from(state.metrics.clone());

    spawn_session_sweeper(state.clone(), config.database.session_sweep_interval_secs);

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    let server_config = config.clone();
    let server_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(from_fn(track_requests))
            .wrap(Logger::default())
            .wrap(build_cors(&server_config))
            .app_data(server_state.clone())
            .app_data(tokens.clone())
            .app_data(metrics.clone())
            .route("/health", web::get().to(health_check))
            .route("/metrics", web::get().to(metrics_handler))
            .service(web::scope("/api/v1").configure(auth::routes::configure))
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::Internal(e.to_string()))?;

    info!("Server stopped, closing connections");
    state.shutdown().await
}
