// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database proxy.
//!
//! Every process of the fabric reaches PostgreSQL through this loopback
//! server instead of opening its own connections. The proxy holds one
//! connection per logical database (see [`pool::ConnectionPool`]) and
//! answers one framed request per TCP connection:
//!
//! ```text
//! {"request": "sql_cmd", "level": "project", "sql": "...", "data": [..],
//!  "as_dict": true, "fetch": 2}
//! {"request": "modify_database_name", "level": "project", "db_name": "..."}
//! ```
//!
//! Failures of any kind are logged and answered with `null`.

pub mod client;
pub mod pool;
pub mod sql;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use wizard_protocol::{BIND_RETRIES, FramedServer, FramedStream, ServerError};

pub use client::DbClient;
pub use pool::{ConnectionPool, Fetch};

use crate::env::Environment;

/// A request to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ProxyRequest {
    /// Execute one statement.
    SqlCmd {
        /// Logical database name.
        level: String,
        /// Statement text with `%s` placeholders.
        sql: String,
        /// Parameters: a list, a single value or `null`.
        #[serde(default)]
        data: Value,
        /// Return rows as objects instead of arrays.
        #[serde(default)]
        as_dict: bool,
        /// `0` execute only, `1` first row, `2` all rows.
        #[serde(default)]
        fetch: u8,
    },
    /// Point a logical name at another database.
    ModifyDatabaseName {
        /// Logical database name.
        level: String,
        /// New database name.
        db_name: String,
    },
}

/// Normalize the `data` field to a parameter list.
pub fn params_of(data: &Value) -> Vec<Value> {
    match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// The proxy server, bound and ready to run.
pub struct DbProxy {
    server: FramedServer,
    pool: Arc<ConnectionPool>,
}

impl DbProxy {
    /// Probe a free loopback port from `start`, skipping `reserved`, bind it
    /// and publish it as `wizard_local_db_server_port`.
    pub async fn bind(
        pool: Arc<ConnectionPool>,
        env: &Environment,
        start: u16,
        reserved: &[u16],
    ) -> Result<Self, ServerError> {
        let server = FramedServer::bind_probing(start, reserved, BIND_RETRIES).await?;
        let port = server.local_addr().port();
        env.set_local_proxy_port(port);
        info!(port, "Database proxy bound");
        Ok(Self { server, pool })
    }

    /// Port the proxy listens on.
    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    /// Connection pool behind the proxy.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Serve until `shutdown` is notified, then close every connection.
    #[instrument(skip_all, fields(port = self.port()))]
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<(), ServerError> {
        let pool = self.pool.clone();
        let handler_pool = pool.clone();
        let result = self
            .server
            .run(
                move |stream, _peer| {
                    let pool = handler_pool.clone();
                    async move { handle_connection(pool, stream).await }
                },
                shutdown,
            )
            .await;
        pool.close_all().await;
        info!("Database proxy stopped");
        result
    }
}

async fn handle_connection(pool: Arc<ConnectionPool>, mut stream: FramedStream<TcpStream>) {
    let request = match stream.read_value().await {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Proxy connection closed before a request");
            return;
        }
    };

    let reply = match serde_json::from_value::<ProxyRequest>(request) {
        Ok(request) => dispatch(&pool, request).await,
        Err(e) => {
            warn!(error = %e, "Malformed proxy request");
            None
        }
    };

    if let Err(e) = stream.write_value(&reply.unwrap_or(Value::Null)).await {
        error!(error = %e, "Failed to send proxy reply");
    }
}

/// Execute one request against the pool.
pub async fn dispatch(pool: &ConnectionPool, request: ProxyRequest) -> Option<Value> {
    match request {
        ProxyRequest::SqlCmd {
            level,
            sql,
            data,
            as_dict,
            fetch,
        } => {
            let Some(fetch) = Fetch::from_code(fetch) else {
                warn!(fetch, "Unknown fetch mode");
                return None;
            };
            pool.execute(&level, &sql, &params_of(&data), fetch, as_dict)
                .await
        }
        ProxyRequest::ModifyDatabaseName { level, db_name } => pool
            .rebind(&level, &db_name)
            .await
            .then(|| Value::from(1)),
    }
}
