//! Mailcast - Broadcast dispatch engine entry point

use anyhow::Result;
use mailcast_api::{cors_layer, create_router, AppState};
use mailcast_common::config::{Config, LoggingConfig};
use mailcast_core::{
    AudienceResolver, BroadcastManager, DispatchWorker, EngineMetrics, EventNormalizer,
    FileTemplates, MetricsAggregator, Orchestrator, Personalizer, SmtpTransport, Stores,
    SystemClock, WinnerSelector,
};
use mailcast_storage::{DatabasePool, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!(hostname = %config.server.hostname, "Starting Mailcast dispatch engine...");

    // Initialize stores
    let (stores, db_pool) = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using the in-memory store; state is lost on shutdown");
            (Stores::in_memory(Arc::new(MemoryStore::new())), None)
        }
        _ => {
            let db_pool = DatabasePool::new(&config.database).await?;
            info!("Database connection established");

            db_pool.migrate().await?;
            info!("Database migrations completed");

            (Stores::postgres(db_pool.clone()), Some(db_pool))
        }
    };

    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(EngineMetrics::new()?);
    let templates = Arc::new(FileTemplates::new(&config.dispatch.template_dir));
    let transport = Arc::new(SmtpTransport::new(
        &config.smtp,
        Duration::from_secs(config.dispatch.transport_timeout_secs),
    )?);
    let personalizer = Arc::new(Personalizer::new(
        config.tracking.unsubscribe_base_url.clone(),
        config.tracking.link_secret.clone(),
    ));

    let aggregator = Arc::new(MetricsAggregator::new(
        stores.broadcasts.clone(),
        stores.dispatch.clone(),
        stores.events.clone(),
    ));
    let winners = Arc::new(WinnerSelector::new(
        stores.broadcasts.clone(),
        aggregator.clone(),
    ));
    let audience = Arc::new(AudienceResolver::new(
        stores.audience.clone(),
        stores.unsubscribes.clone(),
        stores.dispatch.clone(),
    ));
    let manager = Arc::new(
        BroadcastManager::new(
            stores.broadcasts.clone(),
            audience,
            templates.clone(),
            transport.clone(),
            personalizer.clone(),
            winners.clone(),
            clock.clone(),
        )
        .with_transport_timeout(config.dispatch.transport_timeout_secs),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        stores.clone(),
        templates,
        transport,
        personalizer,
        clock.clone(),
        metrics.clone(),
        &config.dispatch,
    ));
    let normalizer = Arc::new(EventNormalizer::new(
        &stores,
        metrics.clone(),
        clock.clone(),
        config.webhooks.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Start dispatch worker
    let worker = DispatchWorker::new(
        manager.clone(),
        orchestrator,
        winners,
        stores.broadcasts.clone(),
        clock,
    )
    .with_tick_interval(config.dispatch.tick_interval_secs);
    let worker_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };

    // Start API server
    let state = AppState {
        manager,
        aggregator,
        normalizer,
        events: stores.events.clone(),
        metrics,
        db_pool,
    };
    let app = create_router(state).layer(cors_layer(&config.api.cors_origins));
    let addr = format!("{}:{}", config.server.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting API server on {}", addr);

    let api_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Mailcast started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(e) = worker_handle.await {
        error!("Dispatch worker did not stop cleanly: {}", e);
    }
    if let Err(e) = api_handle.await {
        error!("API server did not stop cleanly: {}", e);
    }

    info!("Mailcast shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailcast=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
