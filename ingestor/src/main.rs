use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tankmanage_ingestor::config::Config;
use tankmanage_ingestor::gateway::Gateways;
use tankmanage_ingestor::metrics;
use tankmanage_ingestor::mqtt::{MqttGateway, MqttSettings};
use tankmanage_ingestor::pipeline::IngestPipeline;
use tankmanage_ingestor::query::QueryService;
use tankmanage_ingestor::rest::{create_router, AppState};
use tankmanage_ingestor::store::postgres::make_pool;
use tankmanage_ingestor::store::{DashboardRegistry, PgStore, ReadingStore};
use tankmanage_ingestor::sync::{run_cache_rebuild, CacheSynchronizer};
use tankmanage_ingestor::writer::run_writer;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let display_offset = config.display_offset()?;
    let tokens = config.tokens()?;

    info!("Starting TankManage ingestor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    if tokens.is_empty() {
        info!("No access tokens configured, bearer-authenticated routes will reject every call");
    }

    metrics::init_metrics().context("registering metrics")?;

    let pool = make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    let pg = Arc::new(PgStore::new(pool));
    let store: Arc<dyn ReadingStore> = pg.clone();
    let registry: Arc<dyn DashboardRegistry> = pg.clone();

    let synchronizer = CacheSynchronizer::new(registry.clone());
    let pipeline = IngestPipeline::new(store.clone(), synchronizer.clone());
    let gateways = Gateways::new(
        registry.clone(),
        pipeline,
        display_offset,
        config.request_timeout(),
    );
    let query = QueryService::new(store.clone(), display_offset, config.max_query_limit);

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let mqtt = MqttGateway::spawn(
        MqttSettings {
            broker: config.mqtt_broker.clone(),
            port: config.mqtt_port,
            client_id: format!("ingestor-{}", uuid::Uuid::new_v4()),
            credentials: config.mqtt_credentials(),
            topics: config.mqtt_topics.clone(),
            display_offset,
        },
        tx,
    )
    .context("starting MQTT gateway")?;

    let writer_handle = tokio::spawn(run_writer(rx, gateways.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rebuild_handle = config.cache_rebuild_interval().map(|every| {
        tokio::spawn(run_cache_rebuild(
            synchronizer,
            store.clone(),
            every,
            shutdown_rx,
        ))
    });

    let app = create_router(AppState {
        gateways,
        query,
        registry,
        store,
        tokens: Arc::new(tokens),
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let mut server_shutdown = shutdown_tx.subscribe();
    let mut server_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!("HTTP server error: {}", e);
        }
    });

    let server_running = tokio::select! {
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            false
        }
        _ = mqtt.stopped() => {
            error!("MQTT gateway terminated");
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            true
        }
    };

    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    // Dropping the gateway's sender closes the channel, which ends the writer
    mqtt.shutdown().await;
    if let Err(e) = writer_handle.await {
        error!("MQTT writer task failed: {}", e);
    }
    if let Some(handle) = rebuild_handle {
        let _ = handle.await;
    }
    if server_running {
        let _ = server_handle.await;
    }
    pg.close().await;

    info!("Shutdown complete");
    Ok(())
}
