//! Deal Settler - cross-chain deal settlement engine
//!
//! Settles an agreed deal across an origin chain (payment), an intermediary
//! chain (routing) and a destination chain (asset release), streaming each
//! step to the client and optionally pausing for a checkout confirmation.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod deal;
mod error;
mod events;
mod metrics;
mod session;
mod settlement;
mod stream;
mod tx;
mod watcher;

use chain::ChainManager;
use config::{LogFormat, LoggingConfig, Settings};
use metrics::MetricsServer;
use session::ConfirmationGate;
use settlement::{DefaultExecutorProvider, Orchestrator};
use tx::{NonceManager, TransactionSender};
use watcher::PollingWatcher;

const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging can honour it
    let settings = Arc::new(Settings::load()?);

    init_logging(&settings.logging);

    info!("Starting Deal Settler v{}", env!("CARGO_PKG_VERSION"));

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings));
    info!(
        "Chain connections initialized: {:?}",
        chain_manager.connected_chains()
    );
    let testnet_missing = settings.missing_keys(settlement::Mode::Testnet);
    if !testnet_missing.is_empty() {
        warn!(
            "Testnet mode unavailable until configured: {}",
            testnet_missing.join(", ")
        );
    }

    // Shared by every run
    let gate = Arc::new(ConfirmationGate::new());
    let sender = Arc::new(TransactionSender::new(Arc::new(NonceManager::new())));
    let executors = Arc::new(DefaultExecutorProvider::new(
        settings.clone(),
        chain_manager.clone(),
        sender,
        Arc::new(PollingWatcher),
    ));
    let orchestrator = Orchestrator::new(settings.clone(), gate.clone(), executors);

    let http = reqwest::Client::builder()
        .user_agent(concat!("deal-settler/", env!("CARGO_PKG_VERSION")))
        .build()?;

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            settings: settings.clone(),
            gate,
            orchestrator,
            chain_manager: chain_manager.clone(),
            http,
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
                    .await;

                let health = chain_manager.health_check().await;
                let mut all_healthy = true;
                for chain in health {
                    if !chain.healthy {
                        all_healthy = false;
                        warn!("{} chain {} health check failed", chain.role, chain.name);
                    }
                }

                if all_healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Deal Settler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight runs are abandoned with the process
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Deal Settler stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
