use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pig_arena_server::config::ServerConfig;
use pig_arena_server::lobby::{spawn_sweeper, SessionDirectory};
use pig_arena_server::metrics::{self, Metrics};
use pig_arena_server::net::api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Pig Arena Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}:{}, api_port={}, max_sessions={}, target={}",
        config.bind_address,
        config.port,
        config.api_port,
        config.max_sessions,
        config.default_target_score
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let directory = Arc::new(SessionDirectory::new(
        config.directory_settings(),
        metrics.clone(),
    ));
    let sweeper = spawn_sweeper(
        directory.clone(),
        config.sweep_interval,
        config.eviction_timeout,
    );

    let api_directory = directory.clone();
    let api_settings = config.api_settings();
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_directory, api_settings, api_port).await {
            error!("API server error: {}", e);
        }
    });

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = run_join_endpoint(&config, directory.clone(), metrics.clone()) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    sweeper.abort();
    directory.shutdown();
    info!("Server stopped");

    Ok(())
}

#[cfg(feature = "webtransport")]
async fn run_join_endpoint(
    config: &ServerConfig,
    directory: Arc<SessionDirectory>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    use pig_arena_server::net::transport::WebTransportServer;

    let server = WebTransportServer::new(config, directory, metrics).await?;
    info!("Join endpoint ready on https://{}:{}", config.bind_address, config.port);
    info!("Certificate hash: {}", server.cert_hash());
    info!(
        "Chrome flag: --ignore-certificate-errors-spki-list={}",
        server.cert_hash()
    );
    server.run().await
}

#[cfg(not(feature = "webtransport"))]
async fn run_join_endpoint(
    _config: &ServerConfig,
    _directory: Arc<SessionDirectory>,
    _metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    tracing::warn!("Built without the webtransport feature; serving the API only");
    std::future::pending().await
}
