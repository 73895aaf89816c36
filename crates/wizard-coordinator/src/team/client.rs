// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Team client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wizard_protocol::frame::{Frame, read_frame, write_frame};
use wizard_protocol::transport::{
    DEFAULT_CONNECT_TIMEOUT, get_connection, send_bottle_with_timeout, send_signal,
    send_signal_with_conn,
};
use wizard_protocol::{Endpoint, FrameError};

use super::server::kinds;
use crate::error::{Error, Result};

/// Connect timeout of the one-shot messages to the team server.
pub const TEAM_BOTTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply timeout of a prank.
pub const PRANK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask every client of `project` to refresh.
pub async fn refresh_team(endpoint: &Endpoint, project: &str) -> bool {
    let sent = send_bottle_with_timeout(
        endpoint,
        &json!({"type": kinds::REFRESH_TEAM, "project": project}),
        TEAM_BOTTLE_TIMEOUT,
    )
    .await;
    debug!(endpoint = %endpoint, project, sent, "Team refresh sent");
    sent
}

/// Whether the team server at `endpoint` accepts connections.
pub async fn try_connection(endpoint: &Endpoint) -> bool {
    send_bottle_with_timeout(endpoint, &json!({"type": kinds::TEST_CONN}), TEAM_BOTTLE_TIMEOUT)
        .await
}

/// A message queued on the long-lived connection, with its send result.
type Outgoing = (Value, oneshot::Sender<bool>);

/// A long-lived connection to the team server.
pub struct TeamClient {
    endpoint: Endpoint,
    user_name: String,
    project: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TeamClient {
    /// Connect and announce `user_name` in `project`.
    ///
    /// Messages of the project arrive on the returned receiver, which closes
    /// when the connection drops or [`stop`](Self::stop) is called.
    pub async fn connect(
        endpoint: Endpoint,
        user_name: &str,
        project: &str,
        secret: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
        let mut stream = get_connection(&endpoint, DEFAULT_CONNECT_TIMEOUT)
            .await
            .ok_or_else(|| Error::Other(format!("team server {endpoint} unreachable")))?;

        let mut hello = json!({
            "type": kinds::NEW_CLIENT,
            "user_name": user_name,
            "project": project,
        });
        if let Some(secret) = secret {
            hello["secret"] = json!(secret);
        }
        if !send_signal_with_conn(&mut stream, &hello).await {
            return Err(Error::Other(format!("team server {endpoint} refused new_client")));
        }
        info!(endpoint = %endpoint, user = user_name, project, "Connected to team server");

        let (tx, rx) = mpsc::unbounded_channel();
        let (outbox, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();
        let shutdown = Arc::new(Notify::new());
        let own_project = project.to_string();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            let (mut reader, mut writer) = stream.split();
            loop {
                tokio::select! {
                    Some((message, sent)) = outgoing.recv() => {
                        let ok = match Frame::new(&message) {
                            Ok(frame) => write_frame(&mut writer, &frame).await.is_ok(),
                            Err(e) => {
                                warn!(error = %e, "Dropping unencodable team message");
                                false
                            }
                        };
                        let _ = sent.send(ok);
                        if !ok {
                            info!("Team server connection lost while sending");
                            break;
                        }
                    }
                    frame = read_frame(&mut reader) => match frame.and_then(|f| f.to_value()) {
                        Ok(message) => {
                            let foreign = message
                                .get("project")
                                .and_then(Value::as_str)
                                .is_some_and(|p| p != own_project);
                            if foreign {
                                continue;
                            }
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(FrameError::Json(e)) => warn!(error = %e, "Dropping malformed team message"),
                        Err(e) => {
                            info!(error = %e, "Team server connection closed");
                            break;
                        }
                    },
                    _ = stop.notified() => break,
                }
            }
        });

        Ok((
            Self {
                endpoint,
                user_name: user_name.to_string(),
                project: project.to_string(),
                outbox,
                shutdown,
                task,
            },
            rx,
        ))
    }

    /// Server address.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Name this client registered with.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Ask every other client of the project to refresh.
    ///
    /// Sent on this client's connection, so the server does not echo it back.
    pub async fn refresh_team(&self) -> bool {
        self.send(json!({"type": kinds::REFRESH_TEAM, "project": self.project}))
            .await
    }

    /// Queue `message` on the long-lived connection; `true` once written.
    pub async fn send(&self, message: Value) -> bool {
        let (sent, written) = oneshot::channel();
        if self.outbox.send((message, sent)).is_err() {
            debug!(user = %self.user_name, "Team connection already closed");
            return false;
        }
        written.await.unwrap_or(false)
    }

    /// Send `prank_data` to `destination_user`.
    ///
    /// `Some(true)` when delivered, `Some(false)` when the user is not
    /// connected, `None` when the server could not be reached.
    pub async fn send_prank(&self, destination_user: &str, mut prank_data: Value) -> Option<bool> {
        if !prank_data.is_object() {
            prank_data = json!({"content": prank_data});
        }
        prank_data["destination_user"] = json!(destination_user);
        prank_data["origin_user"] = json!(self.user_name);
        let message = json!({
            "type": kinds::PRANK,
            "project": self.project,
            "prank_data": prank_data,
        });
        send_signal(&self.endpoint, &message, PRANK_TIMEOUT)
            .await
            .and_then(|reply| reply.as_bool())
    }

    /// Close the connection; the server announces the departure.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Whether the receive task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TeamClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}
