// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable coordinator runtime.
//!
//! [`CoordinatorRuntime`] starts the local servers of one artist session in
//! a tokio application: database proxy, software bridge, launcher endpoint,
//! export copy pool and, when a team server is configured, the team client.
//!
//! ```rust,ignore
//! use wizard_coordinator::config::Config;
//! use wizard_coordinator::runtime::CoordinatorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CoordinatorRuntime::builder()
//!         .config(Config::from_env()?)
//!         .start()
//!         .await?;
//!
//!     // ... DCC plugins and scripts talk to the published ports ...
//!
//!     runtime.shutdown().await
//! }
//! ```
//!
//! Startup order: the proxy probes its port skipping the bridge's fixed
//! port, the project path is resolved through it, then the bridge and the
//! launcher bind. Shutdown runs in reverse so DCC cleanup still reaches the
//! database.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wizard_protocol::ServerError;

use crate::bridge::{Bridge, BridgeOps, CopyPool};
use crate::catalog::{Catalog, ProxyCatalog};
use crate::config::Config;
use crate::env::Environment;
use crate::hooks::HookDispatcher;
use crate::launcher::{Launcher, LauncherServer};
use crate::proxy::{ConnectionPool, DbClient, DbProxy};
use crate::services::Services;
use crate::team::TeamClient;

type ServerHandle = JoinHandle<std::result::Result<(), ServerError>>;

/// Builder for a [`CoordinatorRuntime`].
#[derive(Default)]
pub struct CoordinatorRuntimeBuilder {
    config: Option<Config>,
    catalog: Option<Arc<dyn Catalog>>,
    hooks: Option<HookDispatcher>,
}

impl CoordinatorRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `catalog` instead of one backed by the proxy.
    ///
    /// Without PostgreSQL credentials in the configuration no proxy is
    /// started.
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use a prepared hook dispatcher, e.g. with in-process hooks.
    pub fn hooks(mut self, hooks: HookDispatcher) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Bind every server and start their tasks.
    pub async fn start(self) -> Result<CoordinatorRuntime> {
        let config = self.config.context("config is required")?;
        let env = Arc::new(Environment::from_config(&config));

        let mut proxy = None;
        if let Some(dns) = config.psql_dns.clone() {
            let pool = Arc::new(ConnectionPool::new(dns, env.clone()));
            let bound = DbProxy::bind(pool, &env, config.proxy_port_start, &[config.bridge_port])
                .await
                .context("failed to bind the database proxy")?;
            let port = bound.port();
            let shutdown = Arc::new(Notify::new());
            let handle = tokio::spawn(bound.run(shutdown.clone()));
            proxy = Some((port, shutdown, handle));
        }

        let catalog: Arc<dyn Catalog> = match (self.catalog, &proxy) {
            (Some(catalog), _) => catalog,
            (None, Some((port, _, _))) => Arc::new(ProxyCatalog::new(DbClient::new(*port))),
            (None, None) => anyhow::bail!("PostgreSQL credentials or a catalog are required"),
        };

        if let Some(project) = env.project_name() {
            match catalog.project_path(&project).await {
                Ok(Some(path)) => {
                    info!(project = %project, path = %path.display(), "Project resolved");
                    env.set_project_path(path);
                }
                Ok(None) => warn!(project = %project, "Project not found in repository"),
                Err(e) => warn!(project = %project, error = %e, "Failed to resolve project path"),
            }
        }

        let hooks = match self.hooks {
            Some(hooks) => hooks,
            None => HookDispatcher::new(env.clone(), config.python.clone()),
        };
        let services = Services::new(env.clone(), catalog, Arc::new(hooks))
            .with_local_path(config.local_path.clone())
            .with_user_folder(config.user_folder.clone())
            .with_plugins_root(config.plugins_root.clone());

        let copies = Arc::new(CopyPool::new());
        let copies_shutdown = copies.shutdown_handle();
        let copies_handle = {
            let copies = copies.clone();
            tokio::spawn(async move { copies.run().await })
        };

        let bridge = Bridge::bind(
            BridgeOps::new(services.clone(), copies),
            &env,
            config.bridge_port,
        )
        .await
        .context("failed to bind the software bridge")?;
        let bridge_port = bridge.port();
        let bridge_shutdown = Arc::new(Notify::new());
        let bridge_handle = tokio::spawn(bridge.run(bridge_shutdown.clone()));

        let launcher = Launcher::new(services.clone());
        if config.unlock_on_start {
            match launcher.unlock_stale_locks().await {
                Ok(released) => debug!(released, "Startup unlock done"),
                Err(e) => warn!(error = %e, "Startup unlock failed"),
            }
        }
        let mut reserved = vec![bridge_port];
        reserved.extend(proxy.as_ref().map(|(port, _, _)| *port));
        let launcher_server = LauncherServer::bind(
            launcher.clone(),
            &env,
            config.proxy_port_start,
            &reserved,
        )
        .await
        .context("failed to bind the launcher")?;
        let launcher_port = launcher_server.port();
        let launcher_shutdown = Arc::new(Notify::new());
        let launcher_handle = tokio::spawn(launcher_server.run(launcher_shutdown.clone()));

        let mut team = None;
        let mut team_messages = None;
        if let (Some(endpoint), Some(user), Some(project)) =
            (env.team_dns(), env.user(), env.project_name())
        {
            match TeamClient::connect(endpoint, &user, &project, config.team_secret.as_deref())
                .await
            {
                Ok((client, messages)) => {
                    team = Some(client);
                    team_messages = Some(messages);
                }
                Err(e) => warn!(error = %e, "Team server unavailable, continuing without it"),
            }
        }

        info!(
            proxy_port = proxy.as_ref().map(|(port, _, _)| *port),
            bridge_port,
            launcher_port,
            team = team.is_some(),
            "CoordinatorRuntime started"
        );

        Ok(CoordinatorRuntime {
            services,
            launcher,
            proxy,
            bridge: (bridge_shutdown, bridge_handle),
            launcher_server: (launcher_shutdown, launcher_handle),
            copies: (copies_shutdown, copies_handle),
            team,
            team_messages,
            bridge_port,
            launcher_port,
        })
    }
}

/// A running coordinator session.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoordinatorRuntime {
    services: Services,
    launcher: Launcher,
    proxy: Option<(u16, Arc<Notify>, ServerHandle)>,
    bridge: (Arc<Notify>, ServerHandle),
    launcher_server: (Arc<Notify>, ServerHandle),
    copies: (Arc<Notify>, JoinHandle<()>),
    team: Option<TeamClient>,
    team_messages: Option<mpsc::UnboundedReceiver<Value>>,
    bridge_port: u16,
    launcher_port: u16,
}

impl CoordinatorRuntime {
    /// Create a new builder.
    pub fn builder() -> CoordinatorRuntimeBuilder {
        CoordinatorRuntimeBuilder::new()
    }

    /// Shared services of the session.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Session environment.
    pub fn env(&self) -> &Arc<Environment> {
        &self.services.env
    }

    /// The launcher.
    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    /// Team connection, when one is open.
    pub fn team(&self) -> Option<&TeamClient> {
        self.team.as_ref()
    }

    /// Messages relayed by the team server; `None` after the first call or
    /// without a team connection.
    pub fn take_team_messages(&mut self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.team_messages.take()
    }

    /// Database proxy port, when the proxy runs.
    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy.as_ref().map(|(port, _, _)| *port)
    }

    /// Software bridge port.
    pub fn bridge_port(&self) -> u16 {
        self.bridge_port
    }

    /// Launcher endpoint port.
    pub fn launcher_port(&self) -> u16 {
        self.launcher_port
    }

    /// Check if every server task is still running.
    pub fn is_running(&self) -> bool {
        let proxy_running = self
            .proxy
            .as_ref()
            .is_none_or(|(_, _, handle)| !handle.is_finished());
        proxy_running
            && !self.bridge.1.is_finished()
            && !self.launcher_server.1.is_finished()
            && !self.copies.1.is_finished()
    }

    /// Stop every server: the launcher first (its DCCs are killed and
    /// unlocked), then the team client, the bridge, pending copies and
    /// finally the proxy.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoordinatorRuntime shutting down...");

        let mut failed = false;
        self.launcher_server.0.notify_one();
        failed |= !join_server("launcher", self.launcher_server.1).await;

        if let Some(team) = &self.team {
            team.stop();
        }

        self.bridge.0.notify_one();
        failed |= !join_server("bridge", self.bridge.1).await;

        self.copies.0.notify_one();
        if let Err(e) = self.copies.1.await {
            error!(error = %e, "Copy pool task panicked");
            failed = true;
        }

        if let Some((_, shutdown, handle)) = self.proxy {
            shutdown.notify_one();
            failed |= !join_server("proxy", handle).await;
        }

        if failed {
            anyhow::bail!("one or more servers failed during shutdown");
        }
        info!("CoordinatorRuntime shutdown complete");
        Ok(())
    }
}

async fn join_server(name: &str, handle: ServerHandle) -> bool {
    match handle.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(server = name, error = %e, "Server error during shutdown");
            false
        }
        Err(e) => {
            error!(server = name, error = %e, "Server task panicked");
            false
        }
    }
}
