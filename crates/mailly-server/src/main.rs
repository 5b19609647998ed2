use clap::Parser;
use mailly_server::server::{
    config::{CliArgs, ServerConfig},
    service::handler::BatchService,
    telemetry::init_telemetry,
    transport::{TransportProvider, smtp::SmtpProvider},
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let provider = SmtpProvider::new(config.smtp.clone())?;
    let service = BatchService::new(&config, Arc::new(provider));

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let result = axum::serve(listener, service.clone().router())
        .with_graceful_shutdown(shutdown_signal(service))
        .await;

    match &result {
        Ok(()) => tracing::info!("Service shut down successfully"),
        Err(e) => tracing::error!("Server error: {e}"),
    }

    providers.shutdown();
    Ok(result?)
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting mail service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting mail service on {} (relay {}:{}, up to {} workers per batch)",
            config.server_addr,
            config.smtp.host,
            config.smtp.port,
            config.dispatch.policy.max_workers
        );
    }
}

async fn shutdown_signal<P: TransportProvider>(service: BatchService<P>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, draining batches...");
    service.shutdown().await;
}
