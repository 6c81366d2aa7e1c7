use std::net::SocketAddr;
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::service::ExecutionService;
use crate::docker::engine::DockerEngine;
use crate::grpc::models::code_runner_server::CodeRunnerServer;
use crate::grpc::services::CodeRunnerImpl;

mod config;
mod constants;
mod core;
mod docker;
mod grpc;
#[cfg(test)]
mod stubs;

/// Runs untrusted submissions in disposable Docker containers and streams the
/// results over gRPC.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "SANDBOX_RUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configured one.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Port to listen on, keeping the configured host.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    set_panic_hook();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }

    let engine = Arc::new(DockerEngine::connect(&config.engine)?);
    let service = ExecutionService::from_config(&config, engine)?;

    if config.engine.sweep_orphans_on_start {
        match service.sweep_orphans().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Removed orphaned containers"),
            Err(err) => tracing::warn!(error = %err, "Orphan sweep failed"),
        }
    }
    match service.health().await.engine {
        Ok(()) => tracing::info!("Container engine reachable"),
        Err(err) => tracing::warn!(error = %err, "Container engine not reachable yet"),
    }

    tracing::info!("gRPC server listening on {}", config.listen);
    Server::builder()
        .add_service(CodeRunnerServer::new(CodeRunnerImpl::new(service.clone())))
        .serve_with_shutdown(config.listen, shutdown_signal())
        .await?;

    tracing::info!("Server stopped, draining submissions");
    service
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
