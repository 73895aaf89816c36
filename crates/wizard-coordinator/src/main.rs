// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! wizard_cmd - headless coordinator session
//!
//! Boots the session environment, starts the database proxy, the software
//! bridge and the launcher (plus the team client when configured), runs a
//! python script against them and exits with the script's code.
//!
//! ```bash
//! wizard_cmd -psqlDns db:5432:wizard:secret -repository studio \
//!     -user lea -project forest -pyfile export_all.py
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use tracing::{error, info, warn};

use wizard_coordinator::config::{Config, normalize_legacy_flags, parse_endpoint};
use wizard_coordinator::env::{PsqlDns, repository_database};
use wizard_coordinator::migrations::{self, Schema};
use wizard_coordinator::runtime::CoordinatorRuntime;

/// Headless wizard session
#[derive(Parser, Debug)]
#[command(name = "wizard_cmd")]
#[command(about = "Run a python script inside a wizard session")]
struct Args {
    /// PostgreSQL server, `host:port:user:password` or a JSON tuple
    #[arg(long = "psqlDns")]
    psql_dns: Option<String>,

    /// Repository name
    #[arg(long)]
    repository: Option<String>,

    /// User name
    #[arg(long)]
    user: Option<String>,

    /// Project name
    #[arg(long)]
    project: Option<String>,

    /// Team server, `host:port` or a JSON tuple
    #[arg(long = "teamDns")]
    team_dns: Option<String>,

    /// Script to run
    #[arg(long)]
    pyfile: Option<PathBuf>,

    /// Create missing catalog tables in the repository and project databases
    #[arg(long = "init-schema")]
    init_schema: bool,
}

impl Args {
    fn apply(self, config: &mut Config) -> anyhow::Result<Option<PathBuf>> {
        if let Some(raw) = self.psql_dns {
            config.psql_dns = Some(PsqlDns::parse(&raw).context("invalid -psqlDns")?);
        }
        if let Some(raw) = self.team_dns.filter(|raw| raw != "null") {
            config.team_dns = Some(parse_endpoint(&raw).context("invalid -teamDns")?);
        }
        config.repository = self.repository.or(config.repository.take());
        config.user = self.user.or(config.user.take());
        config.project = self.project.or(config.project.take());
        Ok(self.pyfile)
    }
}

async fn init_schema(config: &Config) -> anyhow::Result<()> {
    let dns = config.psql_dns.as_ref().context("-psqlDns is required")?;
    let options = |database: &str| {
        PgConnectOptions::new()
            .host(&dns.host)
            .port(dns.port)
            .username(&dns.user)
            .password(&dns.password)
            .database(database)
    };

    if let Some(repository) = &config.repository {
        let mut conn = PgConnection::connect_with(&options(&repository_database(repository))).await?;
        migrations::apply(&mut conn, Schema::Repository).await?;
        conn.close().await?;
    }
    if let Some(project) = &config.project {
        let mut conn = PgConnection::connect_with(&options(project)).await?;
        migrations::apply(&mut conn, Schema::Project).await?;
        conn.close().await?;
    }
    Ok(())
}

async fn run() -> anyhow::Result<u8> {
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let args = Args::parse_from(normalize_legacy_flags(std::env::args()));
    let init = args.init_schema;
    let mut config = Config::from_env()?;
    let pyfile = args.apply(&mut config)?;

    if init {
        init_schema(&config).await?;
        info!("Catalog schema ready");
        if pyfile.is_none() {
            return Ok(0);
        }
    }
    let pyfile = pyfile.context("-pyfile is required")?;
    if !pyfile.is_file() {
        anyhow::bail!("{} is not a file", pyfile.display());
    }

    let python = config.python.clone();
    let runtime = CoordinatorRuntime::builder().config(config).start().await?;

    info!(script = %pyfile.display(), "Running script");
    let status = tokio::process::Command::new(&python)
        .arg(&pyfile)
        .envs(runtime.env().child_env())
        .env("PYTHONUNBUFFERED", "1")
        .status()
        .await;

    runtime.shutdown().await?;

    let status = status.with_context(|| format!("failed to run {python}"))?;
    info!(%status, "Script finished");
    Ok(status
        .code()
        .map(|code| u8::try_from(code).unwrap_or(1))
        .unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wizard_coordinator=info".into()),
        )
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "wizard_cmd failed");
            ExitCode::FAILURE
        }
    }
}
