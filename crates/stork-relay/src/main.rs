use tracing::info;
use tracing_subscriber::EnvFilter;

use stork_relay::{AppState, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stork_relay=debug")),
        )
        .init();

    info!("Starting Stork signaling relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let state = AppState::new(config);

    info!(
        ws = %format!("ws://{http_addr}"),
        health = %format!("http://{http_addr}/health"),
        "Relay endpoints"
    );

    // -----------------------------------------------------------------------
    // 3. Serve until the listener fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    tokio::select! {
        result = stork_relay::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
