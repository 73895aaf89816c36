// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client side of the database proxy.

use serde_json::{Map, Value, json};
use tracing::warn;
use wizard_protocol::Endpoint;
use wizard_protocol::transport::{SIGNAL_TIMEOUT, send_signal};

use super::pool::Fetch;
use crate::env::Environment;

/// Sends framed requests to the database proxy.
#[derive(Debug, Clone)]
pub struct DbClient {
    endpoint: Endpoint,
}

impl DbClient {
    /// Client for a proxy on the local machine.
    pub fn new(port: u16) -> Self {
        Self {
            endpoint: Endpoint::localhost(port),
        }
    }

    /// Client for the proxy published in the environment.
    pub fn from_env(env: &Environment) -> Option<Self> {
        env.local_proxy_port().map(Self::new)
    }

    /// Proxy endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one `sql_cmd`. `None` when the proxy answered `null` or was unreachable.
    pub async fn sql_cmd(
        &self,
        level: &str,
        sql: &str,
        params: &[Value],
        as_dict: bool,
        fetch: Fetch,
    ) -> Option<Value> {
        let request = json!({
            "request": "sql_cmd",
            "level": level,
            "sql": sql,
            "data": params,
            "as_dict": as_dict,
            "fetch": fetch.code(),
        });
        send_signal(&self.endpoint, &request, SIGNAL_TIMEOUT).await
    }

    /// Execute a statement; `true` on success.
    pub async fn execute(&self, level: &str, sql: &str, params: &[Value]) -> bool {
        self.sql_cmd(level, sql, params, false, Fetch::None)
            .await
            .is_some()
    }

    /// First row as an object.
    pub async fn fetch_one(
        &self,
        level: &str,
        sql: &str,
        params: &[Value],
    ) -> Option<Map<String, Value>> {
        match self.sql_cmd(level, sql, params, true, Fetch::One).await? {
            Value::Object(row) => Some(row),
            other => {
                warn!(reply = %other, "Unexpected proxy reply for a single row");
                None
            }
        }
    }

    /// Every row as an object. `None` on failure, empty on no rows.
    pub async fn fetch_all(
        &self,
        level: &str,
        sql: &str,
        params: &[Value],
    ) -> Option<Vec<Map<String, Value>>> {
        match self.sql_cmd(level, sql, params, true, Fetch::All).await? {
            Value::Array(rows) => Some(
                rows.into_iter()
                    .filter_map(|row| match row {
                        Value::Object(row) => Some(row),
                        _ => None,
                    })
                    .collect(),
            ),
            other => {
                warn!(reply = %other, "Unexpected proxy reply for a row set");
                None
            }
        }
    }

    /// Rebind a logical name; `true` when the new database is reachable.
    pub async fn modify_database_name(&self, level: &str, db_name: &str) -> bool {
        let request = json!({
            "request": "modify_database_name",
            "level": level,
            "db_name": db_name,
        });
        send_signal(&self.endpoint, &request, SIGNAL_TIMEOUT)
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use wizard_protocol::{FramedServer, FramedServerConfig};

    async fn fake_proxy(reply: Value) -> (u16, Arc<Mutex<Vec<Value>>>) {
        let server = FramedServer::bind(FramedServerConfig::loopback(0))
            .await
            .unwrap();
        let port = server.local_addr().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = seen.clone();
        tokio::spawn(server.run(
            move |mut stream, _| {
                let seen = seen_handler.clone();
                let reply = reply.clone();
                async move {
                    if let Ok(request) = stream.read_value().await {
                        seen.lock().await.push(request);
                        let _ = stream.write_value(&reply).await;
                    }
                }
            },
            Arc::new(tokio::sync::Notify::new()),
        ));
        (port, seen)
    }

    #[tokio::test]
    async fn test_sql_cmd_request_shape() {
        let (port, seen) = fake_proxy(json!({"id": 3, "name": "0001"})).await;
        let client = DbClient::new(port);

        let row = client
            .fetch_one("project", "SELECT * FROM versions WHERE id = %s", &[json!(3)])
            .await
            .unwrap();
        assert_eq!(row["name"], "0001");

        let seen = seen.lock().await;
        assert_eq!(
            seen[0],
            json!({
                "request": "sql_cmd",
                "level": "project",
                "sql": "SELECT * FROM versions WHERE id = %s",
                "data": [3],
                "as_dict": true,
                "fetch": 1,
            })
        );
    }

    #[tokio::test]
    async fn test_null_reply_is_none() {
        let (port, _) = fake_proxy(Value::Null).await;
        let client = DbClient::new(port);
        assert!(!client.execute("project", "BROKEN", &[]).await);
        assert!(client.fetch_all("project", "SELECT 1", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_from_env_requires_port() {
        let env = Environment::new();
        assert!(DbClient::from_env(&env).is_none());
        env.set_local_proxy_port(11112);
        assert_eq!(DbClient::from_env(&env).unwrap().endpoint().port, 11112);
    }
}
