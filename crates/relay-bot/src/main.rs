//! Signal relay - Entry Point
//!
//! Runs the trading loop and the position monitor against one store.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Signal-to-bracket execution engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via RELAY_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    relay_telemetry::init_logging()?;

    info!("Starting signal relay v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > RELAY_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let config = relay_bot::AppConfig::load(&config_path)?;
    info!(
        ?config.mode,
        store = ?config.store.backend,
        notifier = ?config.notifier.backend,
        subscribers = config.subscribers.len(),
        "Configuration loaded"
    );

    let app = relay_bot::Application::new(config).await?;
    app.run().await?;

    Ok(())
}
