// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Team broadcast server.
//!
//! Every artist's coordinator keeps one connection open here. The first
//! frame of a connection decides what it is:
//!
//! - `new_client {user_name, project[, secret]}`: a long-lived client;
//!   presence is announced to the project and the connection's frames are
//!   relayed to the other members of the same project.
//! - `prank {prank_data: {destination_user, ..}}`: routed to one user; the
//!   sender gets `true` or `false` back on the same connection.
//! - `test_conn`: reachability probe, ignored.
//! - anything else (e.g. a `refresh_team` bottle): relayed to the clients of
//!   the frame's `project`, or to everyone without one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, info, instrument, warn};
use wizard_protocol::frame::{read_frame, write_frame};
use wizard_protocol::{
    Frame, FrameError, FramedServer, FramedServerConfig, FramedStream, ServerError,
};

/// Message type field values.
pub mod kinds {
    /// First frame of a long-lived client.
    pub const NEW_CLIENT: &str = "new_client";
    /// A user joined the project.
    pub const NEW_USER: &str = "new_user";
    /// A user left the project.
    pub const REMOVE_USER: &str = "remove_user";
    /// Ask clients to reload the catalog.
    pub const REFRESH_TEAM: &str = "refresh_team";
    /// Message for a single user.
    pub const PRANK: &str = "prank";
    /// Reachability probe.
    pub const TEST_CONN: &str = "test_conn";
}

/// Team server settings.
#[derive(Debug, Clone)]
pub struct TeamServerConfig {
    /// Address to bind, usually all interfaces.
    pub bind_addr: SocketAddr,
    /// Shared secret `new_client` frames must carry.
    pub secret: Option<String>,
}

impl TeamServerConfig {
    /// All interfaces on `port`, no secret.
    pub fn new(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            secret: None,
        }
    }

    /// Require `secret` in `new_client` frames.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }
}

#[derive(Debug)]
struct ClientRecord {
    project: String,
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<Value>,
}

type Clients = Arc<Mutex<HashMap<String, ClientRecord>>>;

/// The team server, bound and ready to run.
pub struct TeamServer {
    server: FramedServer,
    clients: Clients,
    secret: Option<Arc<str>>,
}

impl TeamServer {
    /// Bind the server socket.
    pub async fn bind(config: TeamServerConfig) -> Result<Self, ServerError> {
        let server = FramedServer::bind(FramedServerConfig::public(config.bind_addr)).await?;
        Ok(Self {
            server,
            clients: Arc::new(Mutex::new(HashMap::new())),
            secret: config.secret.map(Arc::from),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Handle to the connected clients, for inspection.
    pub fn registry(&self) -> TeamRegistry {
        TeamRegistry {
            clients: self.clients.clone(),
        }
    }

    /// Serve until `shutdown` is notified.
    #[instrument(skip_all, fields(addr = %self.local_addr()))]
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<(), ServerError> {
        let clients = self.clients;
        let secret = self.secret;
        let result = self
            .server
            .run(
                move |stream, peer| {
                    let clients = clients.clone();
                    let secret = secret.clone();
                    async move { handle_connection(clients, secret, stream, peer).await }
                },
                shutdown,
            )
            .await;
        info!("Team server stopped");
        result
    }
}

/// Read-only view of the connected clients.
#[derive(Clone)]
pub struct TeamRegistry {
    clients: Clients,
}

impl TeamRegistry {
    /// Connected user names of `project`, sorted.
    pub async fn users(&self, project: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .clients
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.project == project)
            .map(|(name, _)| name.clone())
            .collect();
        users.sort();
        users
    }
}

fn str_field<'a>(msg: &'a Value, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(Value::as_str)
}

/// `destination_user` at the top level or inside `prank_data`.
fn prank_destination(msg: &Value) -> Option<&str> {
    str_field(msg, "destination_user").or_else(|| {
        msg.get("prank_data")
            .and_then(|data| str_field(data, "destination_user"))
    })
}

async fn handle_connection(
    clients: Clients,
    secret: Option<Arc<str>>,
    mut stream: FramedStream<TcpStream>,
    peer: SocketAddr,
) {
    let first = match stream.read_value().await {
        Ok(value) => value,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection closed before a message");
            return;
        }
    };

    match str_field(&first, "type") {
        Some(kinds::TEST_CONN) => debug!(peer = %peer, "Connection test"),
        Some(kinds::NEW_CLIENT) => serve_client(clients, secret, stream, peer, first).await,
        Some(kinds::PRANK) => {
            let delivered = match prank_destination(&first) {
                Some(destination) => send_to(&clients, destination, first.clone()).await,
                None => {
                    warn!(peer = %peer, "Prank without a destination");
                    false
                }
            };
            if let Err(e) = stream.write_value(&delivered).await {
                debug!(peer = %peer, error = %e, "Failed to acknowledge prank");
            }
        }
        _ => {
            let project = str_field(&first, "project").map(str::to_string);
            broadcast(&clients, project.as_deref(), None, &first).await;
        }
    }
}

async fn serve_client(
    clients: Clients,
    secret: Option<Arc<str>>,
    stream: FramedStream<TcpStream>,
    peer: SocketAddr,
    hello: Value,
) {
    if let Some(secret) = &secret
        && str_field(&hello, "secret") != Some(secret.as_ref())
    {
        warn!(peer = %peer, "Rejected client with a wrong secret");
        return;
    }
    let (Some(user_name), Some(project)) = (
        str_field(&hello, "user_name").map(str::to_string),
        str_field(&hello, "project").map(str::to_string),
    ) else {
        warn!(peer = %peer, "new_client without user_name or project");
        return;
    };

    let (outbox, inbox) = mpsc::unbounded_channel();
    {
        let mut map = clients.lock().await;
        if map.contains_key(&user_name) {
            warn!(user = %user_name, peer = %peer, "User already connected, closing new connection");
            return;
        }
        for (peer_name, record) in map.iter().filter(|(_, c)| c.project == project) {
            let _ = outbox.send(presence(kinds::NEW_USER, peer_name, &project));
            let _ = record
                .outbox
                .send(presence(kinds::NEW_USER, &user_name, &project));
        }
        map.insert(
            user_name.clone(),
            ClientRecord {
                project: project.clone(),
                addr: peer,
                outbox,
            },
        );
    }
    info!(user = %user_name, project = %project, peer = %peer, "Client connected");

    let (mut reader, writer) = stream.into_inner().into_split();
    let mut writer_task = tokio::spawn(pump_outbox(writer, inbox));

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame.and_then(|f| f.to_value()) {
                Ok(message) => {
                    broadcast(&clients, Some(&project), Some(&user_name), &message).await;
                }
                Err(FrameError::Json(e)) => {
                    warn!(user = %user_name, error = %e, "Dropping malformed frame");
                }
                Err(_) => break,
            },
            _ = &mut writer_task => {
                debug!(user = %user_name, "Send to client failed");
                break;
            }
        }
    }
    writer_task.abort();
    remove_client(&clients, &user_name, peer).await;
}

async fn pump_outbox(mut writer: OwnedWriteHalf, mut inbox: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = inbox.recv().await {
        let frame = match Frame::new(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                continue;
            }
        };
        if write_frame(&mut writer, &frame).await.is_err() {
            return;
        }
    }
}

fn presence(kind: &str, user_name: &str, project: &str) -> Value {
    json!({"type": kind, "user_name": user_name, "project": project})
}

/// Queue `message` for `user_name`; `false` when not connected.
async fn send_to(clients: &Clients, user_name: &str, message: Value) -> bool {
    match clients.lock().await.get(user_name) {
        Some(record) => record.outbox.send(message).is_ok(),
        None => false,
    }
}

/// Queue `message` for every client of `project` (all when `None`) except `skip`.
async fn broadcast(clients: &Clients, project: Option<&str>, skip: Option<&str>, message: &Value) {
    let targets: Vec<(String, mpsc::UnboundedSender<Value>)> = clients
        .lock()
        .await
        .iter()
        .filter(|(name, c)| {
            project.is_none_or(|p| c.project == p) && skip != Some(name.as_str())
        })
        .map(|(name, c)| (name.clone(), c.outbox.clone()))
        .collect();
    for (name, outbox) in targets {
        if outbox.send(message.clone()).is_err() {
            debug!(user = %name, "Client outbox closed");
        }
    }
}

/// Drop the record of `user_name` if it is still the one from `addr`.
async fn remove_client(clients: &Clients, user_name: &str, addr: SocketAddr) {
    let project = {
        let mut map = clients.lock().await;
        match map.get(user_name) {
            Some(record) if record.addr == addr => map.remove(user_name).map(|r| r.project),
            _ => None,
        }
    };
    if let Some(project) = project {
        info!(user = %user_name, project = %project, "Client disconnected");
        broadcast(
            clients,
            Some(&project),
            None,
            &presence(kinds::REMOVE_USER, user_name, &project),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prank_destination() {
        assert_eq!(
            prank_destination(&json!({"type": "prank", "prank_data": {"destination_user": "max"}})),
            Some("max")
        );
        assert_eq!(
            prank_destination(&json!({"type": "prank", "destination_user": "lea"})),
            Some("lea")
        );
        assert_eq!(prank_destination(&json!({"type": "prank"})), None);
    }

    #[test]
    fn test_config_secret_ignores_empty() {
        assert_eq!(TeamServerConfig::new(1).with_secret(Some(String::new())).secret, None);
        assert_eq!(
            TeamServerConfig::new(1)
                .with_secret(Some("s3".into()))
                .secret
                .as_deref(),
            Some("s3")
        );
    }

    #[tokio::test]
    async fn test_broadcast_scoped_to_project() {
        let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
        let mut inboxes = HashMap::new();
        for (name, project) in [("lea", "forest"), ("max", "forest"), ("zoe", "desert")] {
            let (tx, rx) = mpsc::unbounded_channel();
            clients.lock().await.insert(
                name.to_string(),
                ClientRecord {
                    project: project.to_string(),
                    addr: SocketAddr::from(([127, 0, 0, 1], 1)),
                    outbox: tx,
                },
            );
            inboxes.insert(name, rx);
        }

        let msg = json!({"type": "refresh_team", "project": "forest"});
        broadcast(&clients, Some("forest"), Some("lea"), &msg).await;

        assert!(inboxes.get_mut("lea").unwrap().try_recv().is_err());
        assert_eq!(inboxes.get_mut("max").unwrap().try_recv().unwrap(), msg);
        assert!(inboxes.get_mut("zoe").unwrap().try_recv().is_err());
    }
}
