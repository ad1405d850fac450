//! pulsehub - HTTP server entry point.

use pulsehub::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulsehub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; a missing secret key or JWT secret aborts startup.
    let config = Config::from_env()?;
    info!(
        db_path = config.db_path,
        host = config.host,
        port = config.port,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
