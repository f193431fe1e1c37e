//! Main entry point for the Waypoint agent.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use waypoint_agent::logging::{self, LoggingConfig};
use waypoint_agent::{Agent, AgentConfig, Cli, shutdown, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging_guard = logging::init_logging(&LoggingConfig::from_env())?;

    waypoint_registry::metric::describe();
    waypoint_resolver::metric::describe();

    let config = AgentConfig::load(&cli)?;
    info!(
        store = %config.store.kind,
        namespace = %config.registry.namespace,
        "Waypoint agent starting"
    );

    let token = CancellationToken::new();
    let signals = shutdown::spawn_signal_listener(token.clone());

    let client = store::connect(&config.store).await?;
    let agent = Agent::new(config, client, token.clone());
    let result = agent.run(cli.command).await;

    token.cancel();
    let _ = signals.await;
    if let Err(e) = &result {
        error!("Waypoint agent failed: {:#}", e);
    }
    result
}
