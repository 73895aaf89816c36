// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wizard-coordinator.
//!
//! These errors stay inside the process. At a socket boundary every failure
//! is logged and serialized as `null` (or a `Killed`/`Done` subtask status).

use thiserror::Error;

/// Coordinator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A listening socket could not be opened.
    #[error("Transport error: {0}")]
    Transport(#[from] wizard_protocol::transport::TransportError),

    /// A framed server failed.
    #[error("Server error: {0}")]
    Server(#[from] wizard_protocol::ServerError),

    /// Launching or killing a DCC failed.
    #[error("Launch error: {0}")]
    Launch(#[from] crate::launcher::LaunchError),

    /// Running a subtask failed.
    #[error("Subtask error: {0}")]
    Subtask(#[from] crate::subtask::SubtaskError),

    /// A catalog row was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of row (`work_env`, `version`, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The catalog could not be reached through the proxy.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Result type using coordinator Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("work_env", 42);
        assert_eq!(err.to_string(), "work_env not found: 42");
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = std::io::Error::other("disk full").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
