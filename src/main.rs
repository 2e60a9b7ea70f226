use std::sync::Arc;

use tracing::{error, info, Level};

use tickhost::config::ServerConfig;
use tickhost::metrics::{self, Metrics};
use tickhost::net::acceptor;
use tickhost::net::registry::ConnectionRegistry;
use tickhost::tick::scheduler::TickScheduler;
use tickhost::world::IdleWorld;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Tickhost Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: {}:{}, {} Hz",
        config.bind_address, config.port, config.tick_rate
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // The registry is owned by the tick thread; the acceptor keeps only
    // a handle to its pending queue.
    let registry = ConnectionRegistry::new(config.shuffle_interval_ticks);
    let registry_handle = registry.handle();

    let scheduler = TickScheduler::new(IdleWorld, registry, metrics.clone(), &config);
    let handle = scheduler.handle();
    let tick_thread = std::thread::Builder::new()
        .name("tick".to_string())
        .spawn(move || scheduler.run())?;

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    // Accept connections until the signal arrives or the listener dies
    tokio::select! {
        result = acceptor::run_acceptor(&config, registry_handle, metrics.clone()) => {
            if let Err(e) = result {
                error!("Acceptor error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    handle.stop();
    let result = tokio::task::spawn_blocking(move || tick_thread.join()).await?;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Tick loop terminated with error: {:#}", e),
        Err(_) => error!("Tick thread panicked"),
    }

    info!("Server stopped");
    Ok(())
}
