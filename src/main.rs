//! demovox - voice extraction service
//!
//! Watches an inbox for recorded matches and writes one WAV file per speaker.

use demovox::{service, Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,demovox=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("demovox starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Check the DEMOVOX_* variables in your environment or .env file");
            std::process::exit(1);
        }
    };

    info!("Configuration loaded successfully");
    if config.faceit_api_key.is_some() {
        info!("Match enrichment will use the configured FACEIT API key");
    }

    // Run the service
    if let Err(e) = service::run(config).await {
        error!("Service error: {}", e);
        std::process::exit(1);
    }
}
