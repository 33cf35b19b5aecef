// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! kubejob-agent: started in front of a wrapped container's wait loop.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kubejob_agent::{AgentServer, ServerConfig};
use kubejob_wire::{AGENT_TOKEN_ENV, STATUS_PATH};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubejob-agent", version)]
#[command(about = "Serve exec and file transfer for a kubejob container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for controller sessions
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9820")]
        listen: String,

        /// Sentinel file the container's wait loop polls
        #[arg(long, default_value = STATUS_PATH)]
        status_path: PathBuf,

        /// Session token
        #[arg(long, env = AGENT_TOKEN_ENV, hide_env_values = true)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Output shares the container's log stream
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen, status_path, token } => {
            let config = ServerConfig::new(token).status_path(status_path);
            let server = AgentServer::bind(&listen, config)
                .await
                .with_context(|| format!("failed to listen on {listen}"))?;

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                trigger.cancel();
            });
            server.run(shutdown).await;
        }
    }
    Ok(())
}
