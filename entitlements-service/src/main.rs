//! Entitlements Service entry point.

use entitlements_service::config::EntitlementsConfig;
use entitlements_service::services::init_metrics;
use entitlements_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
    let config = EntitlementsConfig::snapshot().map_err(|e| {
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
        mode = %config.mode,
        "Starting entitlements-service"
    );

    init_metrics();

    // Secrets are reported as present/absent only.
    tracing::info!(
        service_name = %config.service_name,
        http_port = %config.common.port,
        database = config.database.is_some(),
        stripe_enabled = config.stripe_enabled(),
        stripe_webhooks = config.stripe.webhook_secret.is_some(),
        gemini = config.ai.gemini_api_key.is_some(),
        cache_ttl_secs = config.entitlements.cache_ttl.as_secs(),
        grace_period_days = config.entitlements.grace_period_days,
        "Configuration loaded"
    );

    let app = Application::build(config.clone()).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Application error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
