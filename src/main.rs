use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use worldsim::config::ServerConfig;
use worldsim::metrics::{self, Metrics};
use worldsim::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Worldsim Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}, max_clients={}, map={}x{}",
        config.socket_address(),
        config.max_clients,
        config.world_width_tiles,
        config.world_height_tiles
    );

    let metrics = Arc::new(Metrics::new());
    if config.metrics_port != 0 {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let mut server = Server::new(&config, metrics)?;
    let address = server.network.listen(config.socket_address())?;
    info!("Server ready on {}", address);

    // The simulation loop is blocking; it gets its own thread
    let exit = server.exit_flag();
    let mut simulation = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        result = &mut simulation => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server thread failed: {}", e),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down...");
            exit.store(true, Ordering::Release);
            if let Err(e) = simulation.await {
                error!("Server thread failed: {}", e);
            }
        }
    }

    info!("Server stopped");
    Ok(())
}
