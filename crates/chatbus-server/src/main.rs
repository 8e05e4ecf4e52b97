//! # chatbus server
//!
//! Realtime group-messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chatbus
//!
//! # Run with a config file in the working directory
//! cp chatbus.example.toml chatbus.toml && chatbus
//!
//! # Run with environment variables
//! CHATBUS_PORT=8080 CHATBUS_HOST=0.0.0.0 chatbus
//! ```

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatbus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting chatbus server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
