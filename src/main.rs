use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use click_fraud_service::api::{build_router, AppState};
use click_fraud_service::config::{load_config, StoreBackend};
use click_fraud_service::service::ClickFraudService;
use click_fraud_service::store::{KvStore, MemoryStore, RedisStore, TimedStore};
use click_fraud_service::utils::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();
    tracing::info!("Starting click fraud service...");

    // Load configuration
    let settings = load_config().context("loading configuration")?;
    tracing::info!("Configuration loaded successfully");

    tracing::info!(
        host = %settings.server.host,
        port = %settings.server.port,
        backend = ?settings.store.backend,
        "Server configuration loaded"
    );

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let backend: Arc<dyn KvStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&settings.redis.url)
                .await
                .with_context(|| format!("connecting to redis at {}", settings.redis.url))?,
        ),
    };
    let store: Arc<dyn KvStore> = Arc::new(TimedStore::new(
        backend,
        Duration::from_millis(settings.store.timeout_ms),
    ));

    let service = Arc::new(ClickFraudService::new(store, settings.defaults));
    let sweeper = Arc::clone(&service)
        .spawn_sweeper(Duration::from_secs(settings.blocklist.sweep_interval_seconds));

    let app = build_router(
        AppState::new(service, Some(recorder)),
        Duration::from_secs(settings.server.request_timeout_seconds),
    );

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing server address")?;
    tracing::info!(%addr, "Click fraud service listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    sweeper.abort();
    tracing::info!("Click fraud service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
