//! Transaction sync service entry point.

use transaction_sync_service::config::SyncConfig;
use transaction_sync_service::services::init_metrics;
use transaction_sync_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = SyncConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        "Starting transaction-sync-service"
    );

    init_metrics();

    tracing::info!(
        service_name = %config.service_name,
        store_backend = ?config.store.backend,
        feed_url = %config.feed.base_url,
        reward_network_url = %config.reward_network.base_url,
        batch_size = config.publisher.batch_size,
        batch_interval_ms = config.publisher.batch_interval.as_millis() as u64,
        sync_interval_secs = config.schedule.interval.as_secs(),
        lookback_days = config.schedule.lookback_days,
        "Configuration loaded"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;
    let shutdown = app.shutdown_token();

    let run = app.run_until_stopped();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Sync service error");
                return Err(std::io::Error::other(e.to_string()));
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
            shutdown.cancel();
            if let Err(e) = run.await {
                tracing::error!(error = %e, "Sync pass failed during shutdown");
            }
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
