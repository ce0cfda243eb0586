use anyhow::Context;
use clap::Parser;
use hatchery::api::AppState;
use hatchery::cli::Cli;
use hatchery::config::AppConfig;
use hatchery::error::HatcheryError;
use hatchery::logging::init_logging;
use hatchery::remote::RemoteStateClient;
use hatchery::server::{shutdown_signal, start_api_server};
use hatchery::supervisor::Supervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir, &cli.overrides())
        .map_err(HatcheryError::from)
        .with_context(|| format!("loading config from {}", cli.config_dir.display()))?;
    config.validate().map_err(HatcheryError::InvalidConfig)?;

    init_logging(&config.logging);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.host))?;

    let store = Arc::new(RemoteStateClient::new(&config.remote)?);
    let supervisor = Supervisor::new(&config, store);
    info!(
        supervisor = %supervisor.id(),
        key = %supervisor.key(),
        "supervisor starting"
    );

    let reconciler = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.reconcile_from_remote().await })
    };

    let state = AppState::new(supervisor.clone())
        .with_inspector_url(config.server.inspector_url.clone());

    let served = start_api_server(state, addr, shutdown_signal()).await;

    reconciler.abort();
    supervisor.shutdown().await;

    if let Err(e) = &served {
        error!(error = %e, "control API stopped with an error");
    }
    served?;
    info!("supervisor stopped");
    Ok(())
}
