use danci_amas::amas::AMASConfig;
use danci_amas::config::Config;
use danci_amas::logging::init_tracing;
use danci_amas::AmasRuntime;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level);

    let amas_config = match AMASConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid AMAS configuration");
            std::process::exit(1);
        }
    };

    let runtime = if config.database_url.is_some() {
        AmasRuntime::connect(&config, amas_config).await
    } else {
        tracing::warn!("DATABASE_URL not set, running with in-memory storage");
        AmasRuntime::in_memory(amas_config)
    };
    let runtime = match runtime {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "AMAS runtime not initialized");
            std::process::exit(1);
        }
    };

    runtime.start();

    let workers = match runtime.workers().await {
        Ok(manager) => {
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "failed to start workers");
            }
            Some(manager)
        }
        Err(e) => {
            tracing::warn!(error = %e, "worker manager not initialized");
            None
        }
    };

    tracing::info!("AMAS worker host running");
    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    if let Some(manager) = &workers {
        manager.stop().await;
    }
    runtime.shutdown().await;

    tracing::info!("Graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
