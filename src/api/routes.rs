use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::service::ClickFraudService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ClickFraudService>,
    /// Absent when no Prometheus recorder is installed (tests)
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<ClickFraudService>, metrics: Option<PrometheusHandle>) -> Self {
        Self { service, metrics }
    }
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/websites", post(handlers::register_website).get(handlers::list_websites))
        .route("/websites/:website_id", get(handlers::get_website))
        .route(
            "/protection-rules/:website_id",
            get(handlers::get_protection_rules).post(handlers::replace_protection_rules),
        )
        .route(
            "/ip-management/:website_id",
            get(handlers::list_ip_entries).post(handlers::add_ip_entry),
        )
        .route("/ip-management/:website_id/:entry_id", delete(handlers::remove_ip_entry))
        .route("/blocklist/:website_id", get(handlers::list_blocklist))
        .route(
            "/blocklist/:website_id/:ip",
            get(handlers::ip_status).delete(handlers::unblock_ip),
        )
        .route("/analytics", get(handlers::list_analytics))
        .route("/analytics/:website_id", get(handlers::get_analytics))
        .route("/overview", get(handlers::overview))
        .route("/diagnostics", get(handlers::diagnostics))
        .route("/diagnostics/repair-urls", post(handlers::repair_urls));

    Router::new()
        .route("/track-click", post(handlers::track_click))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
