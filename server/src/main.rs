//! Switchyard Server - Main Entry Point

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sy_server::bots::BotRegistry;
use sy_server::worker::{AttachmentFetcher, CommandRunner, SlackClient, WorkerPool};
use sy_server::{api, build_pipeline, config, observability, Backends};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing and metric instruments
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "sy_server=info,tower_http=info".into());
    observability::init(&log_level);

    // Load configuration
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Switchyard Server"
    );

    let bots = BotRegistry::load(&config.bots_config_path)?;
    if bots.is_empty() {
        warn!(path = %config.bots_config_path.display(), "No bots configured; every event will be ignored");
    }
    info!(bots = bots.len(), "Bot configuration loaded");

    let shutdown = CancellationToken::new();

    // Shared store and queue
    let backends = Backends::connect(&config, &shutdown).await?;

    // Workers
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let download_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?;
    let workers = WorkerPool::new(
        backends.queue.clone(),
        bots.clone(),
        Arc::new(CommandRunner::new(
            config.automation_program.clone(),
            config.automation_args.clone(),
            config.automation_timeout,
        )),
        Arc::new(SlackClient::new(http_client, config.slack_api_base.clone())),
        AttachmentFetcher::new(download_client),
        config.worker.clone(),
    )
    .spawn(shutdown.clone());

    // Build application state and router
    let pipeline = build_pipeline(&config, &backends, bots);
    let state = api::AppState::new(pipeline, backends.store.clone(), config.clone());
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Stop claiming tasks and let running ones finish
    shutdown.cancel();
    if let Err(e) = workers.await {
        warn!(error = %e, "Worker pool terminated abnormally");
    }

    info!("Server shutdown complete");

    Ok(())
}
