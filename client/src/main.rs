use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod agent;
mod config;
mod egress;
mod mapping;
mod protocol;
mod state;

use config::AgentConfig;
use state::{AgentState, RuntimeSettings};

#[derive(Debug, Parser)]
#[command(name = "tunnel-client")]
#[command(about = "Connects private HTTP services to a public tunnel relay")]
struct Cli {
    /// Path to the agent configuration document.
    #[arg(long, default_value = "tunnel.json")]
    config: PathBuf,

    /// Relay tunnel URL (e.g. ws://relay.example:3001/ws); overrides
    /// SERVER_WS_URL.
    #[arg(long)]
    server_url: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunnel_client={}", cli.log_level).into()),
        )
        .init();

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let settings = RuntimeSettings::resolve(cli.server_url.clone());
    info!(
        "Agent '{}' serving {} mapping(s), default target {}, relay {}",
        config.client.name,
        config.effective_mappings().len(),
        config.client.default_target,
        settings.server_url
    );

    let state = Arc::new(AgentState::new(config, settings));

    tokio::select! {
        _ = agent::run_agent_loop(state) => {
            // The loop reconnects forever; returning means it broke.
            error!("Agent loop exited unexpectedly");
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("Shutting down");
        }
    }
}

/// Completes on SIGINT or SIGTERM. Dropping the runtime afterwards closes
/// the link, so a normal shutdown exits zero.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
