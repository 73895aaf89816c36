// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for wizard-coordinator.

use std::path::PathBuf;

use wizard_protocol::Endpoint;

use crate::env::PsqlDns;

/// Fixed loopback port of the software-command bridge.
pub const DEFAULT_BRIDGE_PORT: u16 = 11111;
/// First port tried when probing for the database proxy.
pub const DEFAULT_PROXY_PORT_START: u16 = 11111;
/// Fixed loopback port of the subtask bottle listener.
pub const DEFAULT_SUBTASK_PORT: u16 = 10231;
/// Default port of the team broadcast server.
pub const DEFAULT_TEAM_PORT: u16 = 50333;

/// Coordinator configuration loaded from environment variables.
///
/// Command-line flags of the binaries override individual fields after
/// [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL server credentials
    pub psql_dns: Option<PsqlDns>,
    /// Repository name (without the `repository_` database prefix)
    pub repository: Option<String>,
    /// User name logged into the repository
    pub user: Option<String>,
    /// Current project name
    pub project: Option<String>,
    /// Team broadcast server, when the studio runs one
    pub team_dns: Option<Endpoint>,
    /// Bridge port (fixed, loopback)
    pub bridge_port: u16,
    /// First port probed for the database proxy
    pub proxy_port_start: u16,
    /// Subtask listener port (fixed, loopback)
    pub subtask_port: u16,
    /// Port the team server binds when this process hosts it
    pub team_port: u16,
    /// Shared secret required in `new_client` frames, if set
    pub team_secret: Option<String>,
    /// User's local cache used for export staging
    pub local_path: Option<PathBuf>,
    /// Per-user wizard folder (`~/Documents/wizard`)
    pub user_folder: PathBuf,
    /// Directory holding the per-software plugin folders
    pub plugins_root: PathBuf,
    /// Interpreter used for `-pyfile` scripts and `.py` hooks
    pub python: String,
    /// Data directory for subtask logs
    pub data_dir: PathBuf,
    /// Clear the locks held by the current user at startup
    pub unlock_on_start: bool,
    /// Whether a GUI drives this coordinator
    pub gui: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            psql_dns: None,
            repository: None,
            user: None,
            project: None,
            team_dns: None,
            bridge_port: DEFAULT_BRIDGE_PORT,
            proxy_port_start: DEFAULT_PROXY_PORT_START,
            subtask_port: DEFAULT_SUBTASK_PORT,
            team_port: DEFAULT_TEAM_PORT,
            team_secret: None,
            local_path: None,
            user_folder: default_user_folder(),
            plugins_root: default_plugins_root(),
            python: "python3".to_string(),
            data_dir: PathBuf::from(".data"),
            unlock_on_start: true,
            gui: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        let psql_dns = match std::env::var("WIZARD_PSQL_DNS") {
            Ok(raw) => Some(PsqlDns::parse(&raw).ok_or(ConfigError::InvalidValue {
                var: "WIZARD_PSQL_DNS",
                reason: "expected [host, port, user, password] or host:port:user:password",
            })?),
            Err(_) => None,
        };

        let team_dns = match std::env::var("WIZARD_TEAM_DNS") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(parse_endpoint(&raw).ok_or(ConfigError::InvalidValue {
                    var: "WIZARD_TEAM_DNS",
                    reason: "expected host:port or [host, port]",
                })?)
            }
            _ => None,
        };

        Ok(Self {
            psql_dns,
            repository: non_empty_var("WIZARD_REPOSITORY"),
            user: non_empty_var("WIZARD_USER").or_else(current_os_user),
            project: non_empty_var("WIZARD_PROJECT"),
            team_dns,
            bridge_port: port_var("WIZARD_BRIDGE_PORT", default.bridge_port)?,
            proxy_port_start: port_var("WIZARD_PROXY_PORT_START", default.proxy_port_start)?,
            subtask_port: port_var("WIZARD_SUBTASK_PORT", default.subtask_port)?,
            team_port: port_var("WIZARD_TEAM_PORT", default.team_port)?,
            team_secret: non_empty_var("WIZARD_TEAM_SECRET"),
            local_path: non_empty_var("WIZARD_LOCAL_PATH").map(PathBuf::from),
            user_folder: non_empty_var("WIZARD_USER_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(default.user_folder),
            plugins_root: non_empty_var("WIZARD_PLUGINS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.plugins_root),
            python: non_empty_var("WIZARD_PYTHON").unwrap_or(default.python),
            data_dir: non_empty_var("WIZARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.data_dir),
            unlock_on_start: std::env::var("WIZARD_UNLOCK_ON_START")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.unlock_on_start),
            gui: std::env::var("WIZARD_GUI")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.gui),
        })
    }
}

/// Parse a team endpoint given either as `host:port` or as a JSON tuple.
pub fn parse_endpoint(raw: &str) -> Option<Endpoint> {
    serde_json::from_str::<Endpoint>(raw)
        .ok()
        .or_else(|| Endpoint::parse(raw))
}

/// Rewrite legacy single-dash long flags (`-psqlDns`) as `--psqlDns`.
///
/// Short flags (`-h`), values and `--` flags are kept as they are.
pub fn normalize_legacy_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let legacy = i > 0
                && arg.len() > 2
                && arg.starts_with('-')
                && !arg.starts_with("--")
                && arg[1..].starts_with(|c: char| c.is_ascii_alphabetic());
            if legacy { format!("-{arg}") } else { arg }
        })
        .collect()
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn port_var(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidPort(name)),
        Err(_) => Ok(default),
    }
}

fn current_os_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
}

fn default_user_folder() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("Documents")
        .join("wizard")
}

fn default_plugins_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("softwares")))
        .unwrap_or_else(|| PathBuf::from("softwares"))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// What was expected.
        reason: &'static str,
    },
}
