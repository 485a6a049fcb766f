use anyhow::Context;
use axum::{routing::get, Router};
use power_ingestor::cleanup::CleanupScheduler;
use power_ingestor::config::Config;
use power_ingestor::db::{self, PgStore};
use power_ingestor::metrics;
use power_ingestor::mqtt;
use power_ingestor::notify::{ChannelHub, Notifier};
use power_ingestor::pairing::PairingService;
use power_ingestor::queue::{IngestContext, WorkerPool};
use power_ingestor::rest::{self, AppState};
use power_ingestor::store::{DeviceRegistry, ReadingStore};
use power_ingestor::usage::UsageService;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting power ingestor");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_host());
    if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    }

    metrics::init_metrics().context("failed to register metrics")?;

    let pool = db::make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));
    let devices: Arc<dyn DeviceRegistry> = store.clone();
    let readings: Arc<dyn ReadingStore> = store;

    let hub = ChannelHub::new(config.notify_channel_capacity);
    let notifier: Arc<dyn Notifier> = Arc::new(hub.clone());

    let (queue, workers) = WorkerPool::start(
        IngestContext {
            devices: devices.clone(),
            readings: readings.clone(),
            notifier: notifier.clone(),
        },
        config.queue_settings(),
    );

    let mut exhausted = workers.subscribe_exhausted();
    tokio::spawn(async move {
        loop {
            match exhausted.recv().await {
                Ok(dead) => warn!(
                    "Dead-lettered job {} for device {} after {} attempts: {}",
                    dead.job.id, dead.job.device_id, dead.attempts, dead.error
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} dead-letter notifications", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let pairing = Arc::new(PairingService::new(devices.clone(), notifier.clone()));
    let scheduler = CleanupScheduler::new(pairing.clone(), config.cleanup_settings());
    scheduler.start();

    let shutdown = CancellationToken::new();

    let mqtt_handle = config.mqtt_enabled.then(|| {
        let client_id = format!("power-ingestor-{}", uuid::Uuid::new_v4());
        let broker = config.mqtt_broker.clone();
        let port = config.mqtt_port;
        let queue = queue.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(broker, port, client_id, queue, cancel).await {
                error!("MQTT task failed: {}", e);
            }
        })
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState {
            queue,
            pairing,
            usage: UsageService::new(devices.clone(), readings.clone(), notifier),
            devices,
            readings,
            hub,
        }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server_handle => {
            error!("HTTP server terminated: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    shutdown.cancel();

    if !server_handle.is_finished() {
        match server_handle.await {
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    if let Some(handle) = mqtt_handle {
        if let Err(e) = handle.await {
            error!("MQTT task failed: {}", e);
        }
    }

    scheduler.stop().await;

    // Every queue producer is gone now; workers finish what is left.
    workers.join().await;

    info!("Shutdown complete");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
