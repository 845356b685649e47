//! Gantry gateway binary.

use gantry_server::bootstrap::Gateway;
use gantry_server::GatewayConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(config_path) = args.get(1) else {
        eprintln!("usage: gantry <config.yaml|config.json>");
        std::process::exit(2);
    };

    let config = match GatewayConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(path = %config_path, "Starting gantry gateway");

    let gateway = match Gateway::build(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "Failed to start gateway");
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!(error = %e, "Gateway exited with error");
        std::process::exit(1);
    }
}
