//! Arrakis Shards - gateway transport process
//!
//! Runs the shard fleet of this process:
//! - Sizes the fleet from GET /gateway/bot unless TOTAL_SHARDS is set
//! - Publishes dispatches to NATS JetStream, or logs them in local mode
//! - Exposes health/ready/shards endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use arrakis_shards::config::GatewayConfig;
use arrakis_shards::events::{EventSink, LogSink};
use arrakis_shards::health::{self, AppState};
use arrakis_shards::metrics::GatewayMetrics;
use arrakis_shards::nats::{ensure_streams, NatsPublisher, NatsSink};
use arrakis_shards::providers::{GatewayInfoProvider, TwilightInfoProvider};
use arrakis_shards::shard::{ShardManager, WsTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shards={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_start = gateway_config.shard_start,
        shard_end = gateway_config.shard_end,
        total_shards = gateway_config.total_shards,
        "Starting Arrakis Shards"
    );

    // Initialize metrics
    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => match ensure_streams(publisher.jetstream()).await {
                Ok(()) => {
                    metrics.set_nats_connected(true);
                    Some(publisher)
                }
                Err(e) => {
                    error!(error = %e, "Failed to configure NATS streams - running in local mode");
                    metrics.set_nats_connected(false);
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics.set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let (sink, publisher_task): (Arc<dyn EventSink>, _) = match nats {
        Some(ref publisher) => {
            let (sink, task) = NatsSink::spawn(Arc::clone(publisher), metrics.clone());
            (Arc::new(sink), Some(task))
        }
        None => (Arc::new(LogSink), None),
    };

    let info: Arc<dyn GatewayInfoProvider> =
        Arc::new(TwilightInfoProvider::new(gateway_config.discord_token.clone()));

    let total_shards = match gateway_config.total_shards {
        Some(total) => total,
        None => {
            let gateway = info.get_info().await?;
            info!(
                recommended_shards = gateway.recommended_shards,
                remaining_identifies = gateway.session_start_limit.remaining,
                max_concurrency = gateway.session_start_limit.max_concurrency,
                "Fetched gateway sizing"
            );
            gateway.recommended_shards
        }
    };

    info!(intents = ?gateway_config.intents, "Using Discord intents");

    let options = gateway_config.manager_options(total_shards, Some(info));
    let manager = Arc::new(ShardManager::new(
        options,
        Arc::new(WsTransport::default()),
        sink,
        metrics.clone(),
    )?);

    let Some(mut terminal_errors) = manager.take_terminal_errors() else {
        anyhow::bail!("terminal error channel already taken");
    };

    // Spawning takes spawn_shard_delay per shard; serve health meanwhile
    let spawner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = manager.spawn().await {
                error!(error = %e, "Failed to spawn shards");
            }
        })
    };

    // Start health server
    let app_state = AppState {
        manager: Arc::clone(&manager),
        nats: nats.clone(),
        metrics: metrics.clone(),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    // Run everything concurrently
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        Some((shard_id, e)) = terminal_errors.recv() => {
            error!(shard_id, error = %e, "Shard stopped for good - shutting down");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down shards...");

    spawner.abort();
    manager.shutdown().await;

    // Dropping the manager drops the last sink handle so the publisher drains
    drop(manager);
    if let Some(task) = publisher_task {
        match tokio::time::timeout(Duration::from_secs(10), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "NATS publisher task failed"),
            Err(_) => warn!("NATS publisher did not drain in time"),
        }
    }

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
