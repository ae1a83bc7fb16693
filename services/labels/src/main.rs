use anyhow::{Context, Result};
use label_service::config::Config;
use label_service::retrieval::start_api_server;
use label_service::{
    AppState, IngestionHandler, PgResultStore, RekognitionAnalysisClient, RetrievalHandler,
    UploadKafkaConsumer,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Label Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let result_store = Arc::new(
        PgResultStore::new(&config.store)
            .await
            .context("Failed to initialize result store")?,
    );

    // Run migrations if enabled
    if config.store.run_migrations {
        result_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let analysis_client = Arc::new(
        RekognitionAnalysisClient::new(&config.analysis)
            .await
            .context("Failed to initialize analysis client")?,
    );

    let ingestion_handler = Arc::new(IngestionHandler::new(
        analysis_client,
        result_store.clone(),
        config.ingestion.clone(),
    ));

    // Create Kafka consumer
    let kafka_consumer = UploadKafkaConsumer::new(
        &config.kafka,
        config.retry_topic(),
        config.producer_timeout(),
        ingestion_handler,
    )
    .context("Failed to initialize Kafka consumer")?;

    // Create API state
    let api_state = AppState {
        retrieval: RetrievalHandler::new(result_store, config.read_timeout()),
    };

    // Spawn Kafka consumer task
    let mut consumer_handle = tokio::spawn(async move {
        if let Err(e) = kafka_consumer.run().await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Label service started successfully");

    // Wait for shutdown signal, or for the consumer to give up
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down label service");
        }
        _ = &mut consumer_handle => {
            warn!("Kafka consumer exited unexpectedly, shutting down");
        }
    }

    // Abort tasks
    consumer_handle.abort();
    api_handle.abort();

    info!("Label service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
