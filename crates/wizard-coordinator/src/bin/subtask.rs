// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! subtask - control process of one subtask
//!
//! ```bash
//! subtask -cmd "maya -batch -file scene.ma" -cwd /prod/forest -print_stdout
//! subtask -pycmd "print('hello')"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use wizard_coordinator::config::{Config, normalize_legacy_flags};
use wizard_coordinator::env::Environment;
use wizard_coordinator::subtask::{Subtask, SubtaskConfig, SubtaskStatus, build_pycmd};

/// Run one command as a subtask
#[derive(Parser, Debug)]
#[command(name = "subtask")]
#[command(about = "Run a command and report its progress to the subtask listener")]
struct Args {
    /// Shell command to run
    #[arg(long, conflicts_with = "pycmd", required_unless_present = "pycmd")]
    cmd: Option<String>,

    /// Python code or `.py` file run through wizard_cmd
    #[arg(long)]
    pycmd: Option<String>,

    /// Child environment as a JSON object; the current one when unset
    #[arg(long)]
    env: Option<String>,

    /// Working directory of the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Mirror the child output on stdout
    #[arg(long = "print_stdout")]
    print_stdout: bool,
}

fn wizard_cmd_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("wizard_cmd")))
        .unwrap_or_else(|| PathBuf::from("wizard_cmd"))
}

async fn run() -> anyhow::Result<SubtaskStatus> {
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }
    let args = Args::parse_from(normalize_legacy_flags(std::env::args()));
    let config = Config::from_env()?;

    let env: Option<BTreeMap<String, String>> = match &args.env {
        Some(raw) => Some(serde_json::from_str(raw).context("-env must be a JSON object")?),
        None => None,
    };

    let command = match (args.cmd, args.pycmd) {
        (Some(cmd), _) => cmd,
        (None, Some(code)) => {
            let session = match &env {
                Some(vars) => Environment::from_vars(vars),
                None => Environment::from_process_env(),
            };
            build_pycmd(&wizard_cmd_path(), &session, &code)?
        }
        (None, None) => anyhow::bail!("-cmd or -pycmd is required"),
    };

    let mut subtask = SubtaskConfig::new(command, config.subtask_port);
    subtask.env = env;
    subtask.cwd = args.cwd;
    subtask.data_dir = Some(config.data_dir);
    subtask.print_stdout = args.print_stdout;

    let handle = Subtask::spawn(subtask).await?;
    info!(process_id = handle.process_id(), "Subtask running");

    let status = tokio::select! {
        status = handle.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            handle.kill();
            handle.wait().await
        }
    };
    Ok(status)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wizard_coordinator=info".into()),
        )
        .init();

    match run().await {
        Ok(SubtaskStatus::Killed) => ExitCode::from(130),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "subtask failed");
            ExitCode::FAILURE
        }
    }
}
