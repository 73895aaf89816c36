// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One PostgreSQL connection per logical database name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::sql;
use crate::env::{Environment, PsqlDns};

/// Attempts made when the connection breaks under a statement.
pub const MAX_ATTEMPTS: u32 = 5;

/// How many rows a statement should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fetch {
    /// Execute only; reply `1` on success.
    #[default]
    None,
    /// First row, or `null` when there is none.
    One,
    /// Every row.
    All,
}

impl Fetch {
    /// Decode the wire value (`0`, `1` or `2`).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::One),
            2 => Some(Self::All),
            _ => None,
        }
    }

    /// Wire value.
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::One => 1,
            Self::All => 2,
        }
    }
}

#[derive(Default)]
struct Slot {
    database: Option<String>,
    conn: Option<PgConnection>,
}

impl Slot {
    async fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take()
            && let Err(e) = conn.close().await
        {
            debug!(error = %e, "Error closing connection");
        }
    }
}

/// Lazily opened connections keyed by logical name.
///
/// Each entry sits behind its own mutex: one statement is in flight per
/// logical database, different databases proceed in parallel.
pub struct ConnectionPool {
    dns: PsqlDns,
    env: Arc<Environment>,
    bindings: Mutex<HashMap<String, String>>,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ConnectionPool {
    /// Pool connecting with `dns`, resolving logical names through `env`.
    pub fn new(dns: PsqlDns, env: Arc<Environment>) -> Self {
        Self {
            dns,
            env,
            bindings: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Database currently targeted by `level`.
    ///
    /// An explicit rebinding wins; otherwise `repository` and `project`
    /// follow the environment and any other name is a database name.
    pub async fn resolve(&self, level: &str) -> Option<String> {
        if let Some(bound) = self.bindings.lock().await.get(level) {
            return Some(bound.clone());
        }
        match level {
            "repository" => self.env.repository(),
            "project" => self.env.project_name(),
            other => Some(other.to_string()),
        }
    }

    async fn slot(&self, level: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .lock()
            .await
            .entry(level.to_string())
            .or_default()
            .clone()
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.dns.host)
            .port(self.dns.port)
            .username(&self.dns.user)
            .password(&self.dns.password)
            .database(database)
    }

    async fn open(&self, database: &str) -> Result<PgConnection, sqlx::Error> {
        let conn = PgConnection::connect_with(&self.connect_options(database)).await?;
        info!(database, "Opened database connection");
        Ok(conn)
    }

    /// Run one statement against `level`.
    ///
    /// `None` means the statement failed; the reason is logged.
    pub async fn execute(
        &self,
        level: &str,
        statement: &str,
        params: &[Value],
        fetch: Fetch,
        as_dict: bool,
    ) -> Option<Value> {
        let Some(database) = self.resolve(level).await else {
            error!(level, "No database bound to level");
            return None;
        };

        let prepared = match sql::prepare(statement, params) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(level, error = %e, "Rejected statement");
                return None;
            }
        };
        let simple = params.is_empty();

        let slot = self.slot(level).await;
        let mut slot = slot.lock().await;
        if slot.database.as_deref() != Some(database.as_str()) {
            slot.drop_connection().await;
            slot.database = Some(database.clone());
        }

        for attempt in 1..=MAX_ATTEMPTS {
            if slot.conn.is_none() {
                match self.open(&database).await {
                    Ok(conn) => slot.conn = Some(conn),
                    Err(e) => {
                        warn!(database = %database, attempt, error = %e, "Database unreachable");
                        continue;
                    }
                }
            }
            let Some(conn) = slot.conn.as_mut() else {
                continue;
            };

            let result = if simple {
                run_simple(conn, statement, fetch, as_dict).await
            } else {
                run_prepared(conn, &prepared, fetch, as_dict).await
            };

            match result {
                Ok(value) => return Some(value),
                Err(e) if is_connection_error(&e) => {
                    warn!(database = %database, attempt, error = %e, "Connection lost, retrying");
                    slot.drop_connection().await;
                }
                Err(e) => {
                    error!(database = %database, error = %e, sql = statement, "Statement failed");
                    return None;
                }
            }
        }

        error!(database = %database, attempts = MAX_ATTEMPTS, "Giving up on statement");
        None
    }

    /// Rebind `level` to `database`.
    ///
    /// The previous connection is dropped either way; `false` when the new
    /// database cannot be reached.
    pub async fn rebind(&self, level: &str, database: &str) -> bool {
        self.bindings
            .lock()
            .await
            .insert(level.to_string(), database.to_string());

        let slot = self.slot(level).await;
        let mut slot = slot.lock().await;
        slot.drop_connection().await;
        slot.database = Some(database.to_string());

        match self.open(database).await {
            Ok(conn) => {
                slot.conn = Some(conn);
                info!(level, database, "Rebound database level");
                true
            }
            Err(e) => {
                error!(level, database, error = %e, "Rebound level but database is unreachable");
                false
            }
        }
    }

    /// Close every open connection.
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            slot.lock().await.drop_connection().await;
        }
    }
}

async fn run_simple(
    conn: &mut PgConnection,
    statement: &str,
    fetch: Fetch,
    as_dict: bool,
) -> Result<Value, sqlx::Error> {
    let raw = sqlx::raw_sql(statement);
    match fetch {
        Fetch::None => {
            (&mut *conn).execute(raw).await?;
            Ok(Value::from(1))
        }
        Fetch::One => {
            let rows = (&mut *conn).fetch_all(raw).await?;
            Ok(rows
                .first()
                .map(|row| sql::convert_row(row, as_dict))
                .unwrap_or(Value::Null))
        }
        Fetch::All => {
            let rows = (&mut *conn).fetch_all(raw).await?;
            Ok(Value::Array(
                rows.iter().map(|row| sql::convert_row(row, as_dict)).collect(),
            ))
        }
    }
}

async fn run_prepared(
    conn: &mut PgConnection,
    prepared: &sql::Prepared,
    fetch: Fetch,
    as_dict: bool,
) -> Result<Value, sqlx::Error> {
    let query = sql::bind_all(sqlx::query(&prepared.sql), &prepared.binds);
    match fetch {
        Fetch::None => {
            query.execute(&mut *conn).await?;
            Ok(Value::from(1))
        }
        Fetch::One => Ok(query
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| sql::convert_row(&row, as_dict))
            .unwrap_or(Value::Null)),
        Fetch::All => {
            let rows = query.fetch_all(&mut *conn).await?;
            Ok(Value::Array(
                rows.iter().map(|row| sql::convert_row(row, as_dict)).collect(),
            ))
        }
    }
}

/// Errors after which the connection cannot be trusted.
pub fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
