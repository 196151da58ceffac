use std::sync::Arc;

use clap::Parser;
use driplet_agent::cli::Cli;
use driplet_agent::config::{load_env_file, Credentials};
use driplet_agent::discovery::DiscoveryClient;
use driplet_agent::error::AgentError;
use driplet_agent::metrics;
use driplet_agent::relay::{relay_url, WebSocketDialer};
use driplet_agent::session::SessionSettings;
use driplet_agent::shutdown::ShutdownCoordinator;
use driplet_agent::supervisor::AgentSupervisor;
use driplet_agent::telemetry::logging;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AgentError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    if let Some(path) = load_env_file(cli.env_file.as_deref())? {
        info!(path = %path.display(), "loaded environment file");
    }
    let credentials = Arc::new(Credentials::from_env()?);
    let config = cli.agent_config();
    let relay = relay_url(&config.relay_host)?;

    info!(
        user_id = %credentials.user_id,
        api_host = %config.api_host,
        relay = %relay,
        heartbeat_interval = ?config.heartbeat_interval,
        "starting driplet agent"
    );

    let services = DiscoveryClient::new(&config.api_host, Arc::clone(&credentials))
        .fetch_services()
        .await?;

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen_for_interrupt();

    let supervisor = AgentSupervisor::new(
        credentials,
        relay,
        Arc::new(WebSocketDialer),
        SessionSettings::from(&config),
        shutdown.clone(),
    )
    .with_max_concurrent(config.max_concurrent_sessions);
    let report = supervisor.run(services).await;

    shutdown.trigger();
    let _ = listener.await;
    debug!(metrics = %metrics::render(), "final metrics");
    info!(sessions = report.finished(), "driplet agent stopped");
    Ok(())
}
