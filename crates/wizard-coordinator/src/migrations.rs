// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog schemas.
//!
//! The repository and project databases are owned by the pipeline manager;
//! these idempotent scripts create the tables the fabric relies on, for
//! fresh installations and for the database tests.
//!
//! ```ignore
//! use sqlx::Connection;
//! use wizard_coordinator::migrations;
//!
//! let mut conn = sqlx::PgConnection::connect(&project_url).await?;
//! migrations::apply(&mut conn, migrations::Schema::Project).await?;
//! ```

use sqlx::PgConnection;
use tracing::info;

/// Tables of a repository database.
pub const REPOSITORY_SCHEMA: &str = include_str!("../migrations/repository_schema.sql");

/// Tables of a project database.
pub const PROJECT_SCHEMA: &str = include_str!("../migrations/project_schema.sql");

/// Which database a schema belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `repository_<name>`.
    Repository,
    /// A project database.
    Project,
}

impl Schema {
    /// SQL text of the schema.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Repository => REPOSITORY_SCHEMA,
            Self::Project => PROJECT_SCHEMA,
        }
    }
}

/// Create the tables of `schema` that do not exist yet.
pub async fn apply(conn: &mut PgConnection, schema: Schema) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(schema.sql()).execute(&mut *conn).await?;
    info!(?schema, "Schema verified");
    Ok(())
}
