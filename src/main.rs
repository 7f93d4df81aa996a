//! Fedipost binary entry point

use fedipost::{AppState, config, federation::spawn_queue_worker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Initialize AppState (fatal on a missing or corrupt key)
/// 5. Start the delivery queue worker
/// 6. Serve until Ctrl-C, then drain the outbound publisher
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    init_tracing(&config.logging);
    tracing::info!("Starting Fedipost...");
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        federation = config.federation.enabled,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    fedipost::metrics::init_metrics();

    // 4. Initialize application state
    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(%error, "Failed to initialize application state");
            return Err(error.into());
        }
    };

    // 5. Start background tasks
    let worker = if config.federation.enabled {
        tracing::info!(
            tick_secs = config.federation.queue_tick_secs,
            "Delivery queue worker spawned"
        );
        Some(spawn_queue_worker(
            state.worker.clone(),
            config.federation.queue_tick(),
        ))
    } else {
        None
    };

    // 6. Start HTTP server
    let app = fedipost::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Queued deliveries are durable; the worker picks them up after restart
    if let Some(worker) = worker {
        worker.abort();
    }
    state.publisher.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let default_filter = format!("fedipost={},tower_http=info", logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(error) => tracing::error!(%error, "Failed to listen for Ctrl-C"),
    }
}
