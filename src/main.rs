use axum::Router;
use std::net::SocketAddr;
use tracing::{error, info};

mod api;
mod config;
mod models;
mod services;
mod storage;
mod validation;

use api::handlers::AppState;
use config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());
    info!("Storage root: {}", config.storage.root.display());

    let state = AppState::from_config(config.clone()).await.map_err(|e| {
        error!("Failed to initialize services: {}", e);
        e
    })?;

    // Create router with state
    let app: Router = api::routes::create_router_with_state(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
