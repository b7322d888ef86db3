//! Prometheus counters for the auth flows and per-request HTTP metrics.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, HttpResponse};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// One registry per application instance, so tests never share counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub login_success: IntCounter,
    pub login_failed: IntCounter,
    pub register: IntCounter,
    pub oauth_login: IntCounter,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let login_success = counter("login_success_total", "Successful password logins")?;
        let login_failed = counter("login_failed_total", "Password logins refused for bad credentials")?;
        let register = counter("register_total", "Accounts registered with a password")?;
        let oauth_login = counter("oauth_login_total", "Logins through an identity provider")?;

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests served"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let http_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency in seconds"),
            &["method", "path"],
        )?;
        registry.register(Box::new(http_duration.clone()))?;

        Ok(Self {
            registry,
            login_success,
            login_failed,
            register,
            oauth_login,
            http_requests,
            http_duration,
        })
    }

    pub fn observe_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[method, path, status.as_str()])
            .inc();
        self.http_duration
            .with_label_values(&[method, path])
            .observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, method: &str, path: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[method, path, status.as_str()])
            .get()
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Counts and times every request. Paths are labelled by route pattern so
/// ids in the URL do not explode the label set.
pub async fn track_requests(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let metrics = req.app_data::<web::Data<Metrics>>().cloned();
    let method = req.method().to_string();
    let start = Instant::now();

    let res = next.call(req).await?;

    if let Some(metrics) = metrics {
        let path = res
            .request()
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        metrics.observe_request(&method, &path, res.status().as_u16(), start.elapsed());
    }
    Ok(res)
}

pub async fn metrics_handler(metrics: web::Data<Metrics>) -> Result<HttpResponse, AppError> {
    let body = metrics.render()?;
    Ok(HttpResponse::Ok()
        .content_type(TextEncoder::new().format_type())
        .body(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::middleware::from_fn;
    use actix_web::test::{call_service, init_service, TestRequest};
    use actix_web::App;

    #[test]
    fn test_render_lists_auth_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.login_success.inc();
        metrics.login_failed.inc_by(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("login_success_total 1"));
        assert!(text.contains("login_failed_total 2"));
        assert!(text.contains("register_total 0"));
        assert!(text.contains("oauth_login_total 0"));
    }

    #[test]
    fn test_instances_do_not_share_counters() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.register.inc();
        assert_eq!(a.register.get(), 1);
        assert_eq!(b.register.get(), 0);
    }

    #[actix_web::test]
    async fn test_requests_are_labelled_by_route_pattern() {
        let metrics = web::Data::new(Metrics::new().unwrap());
        let app = init_service(
            App::new()
                .app_data(metrics.clone())
                .wrap(from_fn(track_requests))
                .route("/items/{id}", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/metrics", web::get().to(metrics_handler)),
        )
        .await;

        for id in ["1", "2"] {
            let req = TestRequest::get().uri(&format!("/items/{}", id)).to_request();
            call_service(&app, req).await;
        }
        let req = TestRequest::get().uri("/nowhere").to_request();
        call_service(&app, req).await;

        assert_eq!(metrics.request_count("GET", "/items/{id}", 200), 2);
        assert_eq!(metrics.request_count("GET", "unmatched", 404), 1);

        let req = TestRequest::get().uri("/metrics").to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body = actix_web::test::read_body(resp).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("http_request_duration_seconds"));
    }
}
