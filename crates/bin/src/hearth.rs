//! Hearth - house and pixel canvas server binary

use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,server=debug")),
        )
        .init();

    info!("Hearth v{}", env!("CARGO_PKG_VERSION"));

    let config = server::Config::load()?;
    info!("Loaded configuration");
    info!("  Port: {}", config.server.port);
    info!("  Worlds: {}", config.worlds.len());
    info!("  Canvas: {}x{}", config.canvas.width, config.canvas.height);
    if config.canvas.data_dir.is_empty() {
        info!("  Persistence: disabled");
    } else {
        info!("  Persistence: {}", config.canvas.data_dir);
    }

    server::run(config).await?;

    Ok(())
}
