use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use workbench_client::{CommandLauncher, WorkerSupervisor};

use workbench_gateway::{absolutize_cli_path, build_router_with_supervisor};
use workbench_gateway::config::Config;

/// Gateway serving the workbench over HTTP, backed by a single worker
/// process.
#[derive(Parser)]
#[command(name = "workbench-gateway", version)]
struct Cli {
    /// File or folder to open on the root page.
    path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading gateway configuration")?;
    if let Some(path) = cli.path {
        let path = absolutize_cli_path(path).context("resolving the start path argument")?;
        config.start_path_arg = Some(path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    let launcher = Arc::new(CommandLauncher::new(
        config.worker_command.clone(),
        config.worker_args.clone(),
        config.session_sock_dir.clone(),
    ));
    let supervisor = Arc::new(WorkerSupervisor::new(launcher, config.handshake_timeout));

    let bind_addr = config.bind_addr;
    let app = build_router_with_supervisor(config, Arc::clone(&supervisor));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(%bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving the gateway")?;

    supervisor.dispose().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
