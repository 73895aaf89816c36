// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! wizard-team-server - presence and refresh relay of a studio
//!
//! ```bash
//! wizard-team-server --port 50333
//! WIZARD_TEAM_SECRET=s3cret wizard-team-server --host 10.0.0.2
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use wizard_coordinator::config::DEFAULT_TEAM_PORT;
use wizard_coordinator::team::{TeamServer, TeamServerConfig};

/// Wizard team server
#[derive(Parser, Debug)]
#[command(name = "wizard-team-server")]
#[command(about = "Relay presence and refresh signals between artists")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "WIZARD_TEAM_PORT", default_value_t = DEFAULT_TEAM_PORT)]
    port: u16,

    /// Shared secret clients must present
    #[arg(long, env = "WIZARD_TEAM_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wizard_coordinator=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }
    let args = Args::parse();

    let mut config = TeamServerConfig::new(args.port).with_secret(args.secret);
    config.bind_addr = SocketAddr::new(args.host, args.port);
    let secured = config.secret.is_some();

    let server = TeamServer::bind(config).await?;
    info!(addr = %server.local_addr(), secured, "Team server ready");

    let shutdown = Arc::new(Notify::new());
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        stop.notify_one();
    });

    server.run(shutdown).await?;
    info!("Team server shut down");
    Ok(())
}
