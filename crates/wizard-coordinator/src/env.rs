// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide session state and the environment inherited by children.
//!
//! The coordinator keeps its own configuration in an [`Environment`] record
//! shared as `Arc<Environment>`. Children never read that record: each spawn
//! builds an explicit key map with [`Environment::child_env`], and a child
//! that is itself part of the fabric (`wizard_cmd`, `subtask`, DCC plugins)
//! rebuilds its record from those keys with [`Environment::from_vars`].
//!
//! # Inherited keys
//!
//! | Key | Encoding |
//! |-----|----------|
//! | `wizard_user` | string |
//! | `wizard_project_name` | string |
//! | `wizard_project_path` | string |
//! | `wizard_repository` | string (`repository_<name>`) |
//! | `wizard_psql_dns` | JSON `[host, port, user, password]` |
//! | `wizard_local_db_server_port` | integer |
//! | `wizard_team_dns` | JSON `[host, port]`, optional |
//! | `wizard_running_work_envs` | JSON list of integers |
//! | `wizard_gui` | `0` / `1` |
//! | `wizard_softwares_server_port` | integer |
//! | `wizard_communicate_server_port` | integer |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;
use wizard_protocol::Endpoint;

use crate::config::Config;

/// Names of the inherited environment keys.
pub mod keys {
    /// Current user name.
    pub const USER: &str = "wizard_user";
    /// Current project name.
    pub const PROJECT_NAME: &str = "wizard_project_name";
    /// Current project root.
    pub const PROJECT_PATH: &str = "wizard_project_path";
    /// Repository database name.
    pub const REPOSITORY: &str = "wizard_repository";
    /// PostgreSQL credentials.
    pub const PSQL_DNS: &str = "wizard_psql_dns";
    /// Database proxy port.
    pub const LOCAL_DB_SERVER_PORT: &str = "wizard_local_db_server_port";
    /// Team server endpoint.
    pub const TEAM_DNS: &str = "wizard_team_dns";
    /// Work environments spawned by the coordinator.
    pub const RUNNING_WORK_ENVS: &str = "wizard_running_work_envs";
    /// GUI flag.
    pub const GUI: &str = "wizard_gui";
    /// Launcher endpoint port.
    pub const SOFTWARES_SERVER_PORT: &str = "wizard_softwares_server_port";
    /// Bridge port.
    pub const COMMUNICATE_SERVER_PORT: &str = "wizard_communicate_server_port";
}

/// PostgreSQL server credentials `(host, port, user, password)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(String, u16, String, String)",
    into = "(String, u16, String, String)"
)]
pub struct PsqlDns {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login role.
    pub user: String,
    /// Login password.
    pub password: String,
}

impl PsqlDns {
    /// Build credentials.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Parse either the JSON tuple form or `host:port:user:password`.
    ///
    /// In the colon form the password is everything after the third colon.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(dns) = serde_json::from_str::<PsqlDns>(raw) {
            return Some(dns);
        }
        let mut parts = raw.trim().splitn(4, ':');
        let host = parts.next()?.to_string();
        let port = parts.next()?.parse().ok()?;
        let user = parts.next()?.to_string();
        let password = parts.next().unwrap_or_default().to_string();
        if host.is_empty() || user.is_empty() {
            return None;
        }
        Some(Self::new(host, port, user, password))
    }

    /// JSON tuple form, as published in `wizard_psql_dns`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl std::fmt::Debug for PsqlDns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsqlDns")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl From<(String, u16, String, String)> for PsqlDns {
    fn from((host, port, user, password): (String, u16, String, String)) -> Self {
        Self {
            host,
            port,
            user,
            password,
        }
    }
}

impl From<PsqlDns> for (String, u16, String, String) {
    fn from(dns: PsqlDns) -> Self {
        (dns.host, dns.port, dns.user, dns.password)
    }
}

/// Prefix of repository database names.
pub const REPOSITORY_PREFIX: &str = "repository_";

/// Database name of a repository.
pub fn repository_database(name: &str) -> String {
    if name.starts_with(REPOSITORY_PREFIX) {
        name.to_string()
    } else {
        format!("{REPOSITORY_PREFIX}{name}")
    }
}

#[derive(Debug, Clone, Default)]
struct EnvState {
    user: Option<String>,
    project_name: Option<String>,
    project_path: Option<PathBuf>,
    repository: Option<String>,
    psql_dns: Option<PsqlDns>,
    local_proxy_port: Option<u16>,
    team_dns: Option<Endpoint>,
    running_work_envs: Vec<i64>,
    gui: bool,
    softwares_server_port: Option<u16>,
    communicate_server_port: Option<u16>,
}

/// Process-wide session state.
#[derive(Debug, Default)]
pub struct Environment {
    state: RwLock<EnvState>,
}

macro_rules! getter {
    ($(#[$doc:meta])* $name:ident, $field:ident, $key:expr, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&self) -> Option<$ty> {
            let value = self.read().$field.clone();
            if value.is_none() {
                warn!(key = $key, "Environment key is not set");
            }
            value
        }
    };
}

impl Environment {
    /// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment seeded from the coordinator configuration.
    ///
    /// The project path is not part of the configuration; it is resolved
    /// from the repository once the proxy is up.
    pub fn from_config(config: &Config) -> Self {
        let env = Self::new();
        {
            let mut state = env.write();
            state.user = config.user.clone();
            state.project_name = config.project.clone();
            state.repository = config.repository.as_deref().map(repository_database);
            state.psql_dns = config.psql_dns.clone();
            state.team_dns = config.team_dns.clone();
            state.gui = config.gui;
        }
        env
    }

    /// Rebuild an environment from inherited keys.
    ///
    /// Unknown keys are ignored; malformed values are logged and skipped.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let env = Self::new();
        {
            let mut state = env.write();
            for (key, value) in vars {
                let value = value.as_ref();
                match key.as_ref() {
                    keys::USER => state.user = Some(value.to_string()),
                    keys::PROJECT_NAME => state.project_name = Some(value.to_string()),
                    keys::PROJECT_PATH => state.project_path = Some(PathBuf::from(value)),
                    keys::REPOSITORY => state.repository = Some(value.to_string()),
                    keys::PSQL_DNS => match PsqlDns::parse(value) {
                        Some(dns) => state.psql_dns = Some(dns),
                        None => warn!(key = keys::PSQL_DNS, "Ignoring malformed value"),
                    },
                    keys::LOCAL_DB_SERVER_PORT => {
                        state.local_proxy_port = parse_port(keys::LOCAL_DB_SERVER_PORT, value)
                    }
                    keys::TEAM_DNS => state.team_dns = serde_json::from_str(value).ok(),
                    keys::RUNNING_WORK_ENVS => {
                        state.running_work_envs = serde_json::from_str(value).unwrap_or_default()
                    }
                    keys::GUI => state.gui = value == "1" || value == "true",
                    keys::SOFTWARES_SERVER_PORT => {
                        state.softwares_server_port =
                            parse_port(keys::SOFTWARES_SERVER_PORT, value)
                    }
                    keys::COMMUNICATE_SERVER_PORT => {
                        state.communicate_server_port =
                            parse_port(keys::COMMUNICATE_SERVER_PORT, value)
                    }
                    _ => {}
                }
            }
        }
        env
    }

    /// Rebuild the environment of a process started by the coordinator.
    pub fn from_process_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EnvState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EnvState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    getter!(
        /// Current user name.
        user, user, keys::USER, String
    );
    getter!(
        /// Current project name.
        project_name, project_name, keys::PROJECT_NAME, String
    );
    getter!(
        /// Current project root.
        project_path, project_path, keys::PROJECT_PATH, PathBuf
    );
    getter!(
        /// Repository database name (`repository_<name>`).
        repository, repository, keys::REPOSITORY, String
    );
    getter!(
        /// PostgreSQL credentials.
        psql_dns, psql_dns, keys::PSQL_DNS, PsqlDns
    );
    getter!(
        /// Port of the database proxy.
        local_proxy_port, local_proxy_port, keys::LOCAL_DB_SERVER_PORT, u16
    );
    getter!(
        /// Port of the launcher endpoint.
        softwares_server_port, softwares_server_port, keys::SOFTWARES_SERVER_PORT, u16
    );
    getter!(
        /// Port of the bridge.
        communicate_server_port, communicate_server_port, keys::COMMUNICATE_SERVER_PORT, u16
    );

    /// Team server endpoint. Optional by design, so no warning when unset.
    pub fn team_dns(&self) -> Option<Endpoint> {
        self.read().team_dns.clone()
    }

    /// Work environments currently spawned by this process.
    pub fn running_work_envs(&self) -> Vec<i64> {
        self.read().running_work_envs.clone()
    }

    /// Whether a GUI drives this process.
    pub fn gui(&self) -> bool {
        self.read().gui
    }

    /// Set the current user.
    pub fn set_user(&self, user: impl Into<String>) {
        self.write().user = Some(user.into());
    }

    /// Switch to a project.
    pub fn set_project(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let mut state = self.write();
        state.project_name = Some(name.into());
        state.project_path = Some(path.into());
    }

    /// Set the project root alone.
    pub fn set_project_path(&self, path: impl Into<PathBuf>) {
        self.write().project_path = Some(path.into());
    }

    /// Set the repository by name; stored as its database name.
    pub fn set_repository(&self, name: &str) {
        self.write().repository = Some(repository_database(name));
    }

    /// Set the PostgreSQL credentials.
    pub fn set_psql_dns(&self, dns: PsqlDns) {
        self.write().psql_dns = Some(dns);
    }

    /// Publish the database proxy port.
    pub fn set_local_proxy_port(&self, port: u16) {
        self.write().local_proxy_port = Some(port);
    }

    /// Set or clear the team server endpoint.
    pub fn set_team_dns(&self, endpoint: Option<Endpoint>) {
        self.write().team_dns = endpoint;
    }

    /// Replace the running work-environment list.
    pub fn set_running_work_envs(&self, mut ids: Vec<i64>) {
        ids.sort_unstable();
        ids.dedup();
        self.write().running_work_envs = ids;
    }

    /// Set the GUI flag.
    pub fn set_gui(&self, gui: bool) {
        self.write().gui = gui;
    }

    /// Publish the launcher endpoint port.
    pub fn set_softwares_server_port(&self, port: u16) {
        self.write().softwares_server_port = Some(port);
    }

    /// Publish the bridge port.
    pub fn set_communicate_server_port(&self, port: u16) {
        self.write().communicate_server_port = Some(port);
    }

    /// Keys every child of the coordinator inherits.
    ///
    /// Built fresh on every call; unset optional keys are left out.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let state = self.read();
        let mut vars = BTreeMap::new();

        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                vars.insert(key.to_string(), value);
            }
        };
        put(keys::USER, state.user.clone());
        put(keys::PROJECT_NAME, state.project_name.clone());
        put(
            keys::PROJECT_PATH,
            state
                .project_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        put(keys::REPOSITORY, state.repository.clone());
        put(keys::PSQL_DNS, state.psql_dns.as_ref().map(PsqlDns::to_json));
        put(
            keys::LOCAL_DB_SERVER_PORT,
            state.local_proxy_port.map(|p| p.to_string()),
        );
        put(
            keys::TEAM_DNS,
            state
                .team_dns
                .as_ref()
                .and_then(|e| serde_json::to_string(e).ok()),
        );
        put(
            keys::RUNNING_WORK_ENVS,
            serde_json::to_string(&state.running_work_envs).ok(),
        );
        put(keys::GUI, Some(if state.gui { "1" } else { "0" }.to_string()));
        put(
            keys::SOFTWARES_SERVER_PORT,
            state.softwares_server_port.map(|p| p.to_string()),
        );
        put(
            keys::COMMUNICATE_SERVER_PORT,
            state.communicate_server_port.map(|p| p.to_string()),
        );
        vars
    }
}

fn parse_port(key: &str, value: &str) -> Option<u16> {
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(key, value, "Ignoring malformed port");
            None
        }
    }
}
