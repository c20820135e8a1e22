//! relay-agent: expose a local service through a relay

use anyhow::{Context, Result};
use clap::Parser;
use relay_agent::{Agent, AgentConfig, AgentOverrides};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "relay-agent",
    about = "Keep a local service reachable through a relay",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "RELAY_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: AgentOverrides,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("relay_agent={level},relay_transport_quic={level}").into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    cli.overrides.apply(&mut config);

    init_tracing(&config.log_level);

    info!("Starting relay agent");
    info!("Relay: {} ({})", config.relay_addr, config.server_name);
    info!("Backend id: {}", config.backend_id);
    info!("Forwarding to: {}", config.local_address);

    let agent = Arc::new(Agent::new(config).context("Invalid agent configuration")?);

    let signal_agent = agent.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutting down");
        signal_agent.shutdown().await;
    });

    agent.run().await.context("Agent stopped")?;
    Ok(())
}
