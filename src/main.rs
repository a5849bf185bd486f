use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use cas_tier_router::config::{Cli, Config};
use cas_tier_router::server::api::{build_router, AppState};
use cas_tier_router::service::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "cas_tier_router=debug,tower_http=debug"
    } else {
        "cas_tier_router=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("cas-tier-router v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        tier_a_threshold = config.classifier.tier_a_threshold,
        tier_b_threshold = config.classifier.tier_b_threshold,
        frequency_threshold = config.promotion.frequency_threshold,
        min_confidence = config.promotion.min_confidence,
        ttl_secs = config.eviction.ttl_secs,
        "Configuration loaded"
    );

    let service = Service::start(config).await?;
    let listen_addr = service.config.server.listen.clone();

    // Build the HTTP router.
    let app = build_router(Arc::new(AppState::new(&service)));

    // Start the server.
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
