use std::error::Error;
use std::path::PathBuf;

use behide_link::config::HubConfig;
use behide_link::signaling::{DEFAULT_SIGNALING_PORT, SignalingServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => toml::from_str(&std::fs::read_to_string(&path)?)?,
        None => HubConfig::default(),
    };
    let port = std::env::var("HUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_SIGNALING_PORT);
    let bind_addr = format!("0.0.0.0:{}", port);

    println!("   Behide Signaling Hub");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::new(config);
    tokio::select! {
        result = server.run(&bind_addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
