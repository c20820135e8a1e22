//! relay-server: public entry point for backends behind NAT

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_auth::SharedSecret;
use relay_server::{RelayConfig, RelayOverrides, RelayServer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "relay-server",
    about = "Relay public HTTP and WebSocket traffic to backends over QUIC",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// YAML configuration file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: RelayOverrides,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mint a backend token signed with the relay secret
    GenerateToken {
        /// Shared secret (at least 32 bytes)
        #[arg(long, env = "RELAY_JWT_SECRET", hide_env_values = true)]
        secret: String,

        /// Backend id the token is bound to
        #[arg(long)]
        backend_id: String,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("relay_server={level},relay_control={level},relay_transport_quic={level},tower_http=warn").into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateToken {
        secret,
        backend_id,
        hours,
    }) = cli.command
    {
        let secret = SharedSecret::new(secret).context("Invalid secret")?;
        let token = secret
            .mint(&backend_id, chrono::Duration::hours(hours))
            .context("Failed to mint token")?;
        println!("{}", token);
        return Ok(());
    }

    let mut config = RelayConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    cli.overrides.apply(&mut config);

    init_tracing(&config.log_level);

    info!("Starting relay server");
    info!("Public URL: {}", config.public_url);
    info!("Duplicate policy: {:?}", config.duplicate_policy);
    if config.public_auth {
        info!("Public bearer authentication enabled");
    }

    let server = RelayServer::bind(config)
        .await
        .context("Failed to start relay")?;
    server.run().await.context("Relay failed")?;

    Ok(())
}
