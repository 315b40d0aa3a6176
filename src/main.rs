//! Relay/recorder binary
//!
//! Entry point: loads the configuration, starts the core and runs until
//! SIGINT/SIGTERM.

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate::config::Config;
use streamgate::core::Core;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "streamgate.toml".to_string());
    let config = Config::load(Some(&config_path))?;

    tracing::info!(
        config = %config_path,
        paths = config.paths.len(),
        "starting"
    );

    let token = CancellationToken::new();
    let core = Core::new(config, token.clone())?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping...");

    token.cancel();
    core.wait().await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
