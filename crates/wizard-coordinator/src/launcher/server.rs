// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback endpoint of the launcher.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use wizard_protocol::transport::{SIGNAL_TIMEOUT, send_signal};
use wizard_protocol::{BIND_RETRIES, Endpoint, FramedServer, FramedStream, ServerError};

use super::Launcher;
use crate::env::Environment;

/// A request to the launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum LauncherRequest {
    Launch { version_id: i64 },
    Kill { work_env_id: i64 },
    KillAll,
    Get,
}

/// Run one request. `launch` answers the work environment id or `null`,
/// `kill` and `kill_all` answer `true`, `get` the running ids.
pub async fn dispatch(launcher: &Launcher, request: LauncherRequest) -> Value {
    match request {
        LauncherRequest::Launch { version_id } => match launcher.launch_work_version(version_id).await {
            Ok(work_env_id) => json!(work_env_id),
            Err(e) => {
                warn!(version_id, error = %e, "Launch refused");
                Value::Null
            }
        },
        LauncherRequest::Kill { work_env_id } => {
            launcher.kill(work_env_id).await;
            json!(true)
        }
        LauncherRequest::KillAll => {
            launcher.kill_all().await;
            json!(true)
        }
        LauncherRequest::Get => json!(launcher.running().await),
    }
}

/// The launcher server, bound and ready to run.
pub struct LauncherServer {
    server: FramedServer,
    launcher: Launcher,
}

impl LauncherServer {
    /// Probe a free loopback port from `start`, skipping `reserved`, bind it
    /// and publish it as `wizard_softwares_server_port`.
    pub async fn bind(
        launcher: Launcher,
        env: &Environment,
        start: u16,
        reserved: &[u16],
    ) -> Result<Self, ServerError> {
        let server = FramedServer::bind_probing(start, reserved, BIND_RETRIES).await?;
        let port = server.local_addr().port();
        env.set_softwares_server_port(port);
        info!(port, "Launcher bound");
        Ok(Self { server, launcher })
    }

    /// Port the launcher listens on.
    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    /// Serve until `shutdown` is notified, then kill every running DCC.
    #[instrument(skip_all, fields(port = self.port()))]
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<(), ServerError> {
        let launcher = self.launcher.clone();
        let handler_launcher = launcher.clone();
        let result = self
            .server
            .run(
                move |stream, _peer| {
                    let launcher = handler_launcher.clone();
                    async move { handle_connection(launcher, stream).await }
                },
                shutdown,
            )
            .await;
        let killed = launcher.kill_all().await;
        info!(killed, "Launcher stopped");
        result
    }
}

async fn handle_connection(launcher: Launcher, mut stream: FramedStream<TcpStream>) {
    let reply = match stream.read_value().await {
        Ok(request) => match serde_json::from_value::<LauncherRequest>(request) {
            Ok(request) => dispatch(&launcher, request).await,
            Err(e) => {
                warn!(error = %e, "Malformed launcher request");
                Value::Null
            }
        },
        Err(e) => {
            debug!(error = %e, "Launcher connection closed before a request");
            return;
        }
    };
    if let Err(e) = stream.write_value(&reply).await {
        error!(error = %e, "Failed to send launcher reply");
    }
}

/// Client of a launcher running in another process.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherClient {
    endpoint: Endpoint,
}

impl LauncherClient {
    /// Client of the launcher on loopback `port`.
    pub fn new(port: u16) -> Self {
        Self {
            endpoint: Endpoint::localhost(port),
        }
    }

    /// Client of the launcher published in `env`.
    pub fn from_env(env: &Environment) -> Option<Self> {
        env.softwares_server_port().map(Self::new)
    }

    async fn call(&self, request: LauncherRequest) -> Option<Value> {
        let message = serde_json::to_value(&request).ok()?;
        send_signal(&self.endpoint, &message, SIGNAL_TIMEOUT).await
    }

    /// Open a work version; the work environment id on success.
    pub async fn launch(&self, version_id: i64) -> Option<i64> {
        self.call(LauncherRequest::Launch { version_id })
            .await
            .and_then(|v| v.as_i64())
    }

    /// Kill the DCC of a work environment.
    pub async fn kill(&self, work_env_id: i64) -> bool {
        self.call(LauncherRequest::Kill { work_env_id }).await.is_some()
    }

    /// Kill every DCC.
    pub async fn kill_all(&self) -> bool {
        self.call(LauncherRequest::KillAll).await.is_some()
    }

    /// Running work environments.
    pub async fn running(&self) -> Vec<i64> {
        self.call(LauncherRequest::Get)
            .await
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}
