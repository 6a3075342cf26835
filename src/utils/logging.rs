use std::env;
use tracing_subscriber::{fmt::time::ChronoUtc, EnvFilter};

/// Initialize the logging system with the level from `RUST_LOG`
///
/// Calling this more than once is harmless; later calls keep the first subscriber.
pub fn init_logging() {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_timer(ChronoUtc::rfc_3339())
        .try_init();
}

/// Create a new span for tracking a single click evaluation
pub fn create_request_span(request_id: &str, tenant: &str) -> tracing::Span {
    tracing::info_span!(
        "click",
        request_id = %request_id,
        tenant = %tenant,
    )
}

/// Log the outcome of a click evaluation
pub fn log_decision(tenant: &str, ip: &str, blocked: bool, reason: &str) {
    if blocked {
        tracing::warn!(
            tenant = %tenant,
            ip = %ip,
            reason = %reason,
            event = "click_blocked",
        );
    } else {
        tracing::debug!(
            tenant = %tenant,
            ip = %ip,
            reason = %reason,
            event = "click_allowed",
        );
    }
}

/// Log a new or extended blocklist entry
pub fn log_block_inserted(tenant: &str, ip: &str, rule_id: &str, expires_at: &str) {
    tracing::warn!(
        tenant = %tenant,
        ip = %ip,
        rule_id = %rule_id,
        expires_at = %expires_at,
        event = "ip_blocked",
    );
}

/// Log a backing store failure on a path that has to react to it
pub fn log_store_failure(tenant: &str, operation: &str, error: &dyn std::error::Error) {
    tracing::error!(
        tenant = %tenant,
        operation = %operation,
        error = %error,
        event = "store_failure",
    );
}

/// Log blocklist evictions from either the lazy or the sweep path
pub fn log_eviction(path: &str, evicted: usize) {
    if evicted > 0 {
        tracing::info!(path = %path, evicted = %evicted, event = "blocklist_eviction");
    }
}

/// Log a service lifecycle or management event
pub fn log_service_event(event_type: &str, success: bool, details: Option<&str>) {
    if success {
        tracing::info!(event_type = %event_type, success = %success, details = ?details);
    } else {
        tracing::error!(event_type = %event_type, success = %success, details = ?details);
    }
}
