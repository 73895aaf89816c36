// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wizard Coordinator - coordination fabric of the pipeline manager
//!
//! This crate provides the long-running services that let the desktop
//! client, the PostgreSQL catalog, DCC instances and background jobs talk
//! to each other on an artist's workstation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │ GUI / script │   │ DCC plugins  │   │   subtasks   │   │  hooks    │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘   └─────┬─────┘
//!        │ launch           │ bridge           │ bottles         │
//!        ▼                  ▼                  ▼                 │
//! ┌─────────────────────────────────────────────────────────────┐│
//! │                  wizard-coordinator (this crate)            ││
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌─────────────┐  ││
//! │  │ launcher │  │  bridge  │  │ listener │  │ team client │◄─┘│
//! │  └────┬─────┘  └────┬─────┘  └──────────┘  └──────┬──────┘   │
//! │       └──────┬──────┘                             │          │
//! │              ▼                                    │          │
//! │       ┌────────────┐                              │          │
//! │       │  db proxy  │ one connection per database  │          │
//! │       └─────┬──────┘                              │          │
//! └─────────────┼─────────────────────────────────────┼──────────┘
//!               ▼                                     ▼
//!        ┌────────────┐                      ┌────────────────┐
//!        │ PostgreSQL │                      │  team server   │
//!        └────────────┘                      └────────────────┘
//! ```
//!
//! Every link is a TCP connection carrying length-prefixed JSON frames
//! (see `wizard-protocol`). Errors never cross a socket: a failed request is
//! logged and answered with `null`.
//!
//! # Ports
//!
//! | Server | Port | Bind |
//! |--------|------|------|
//! | software bridge | 11111 | loopback |
//! | database proxy | probed from 11111, published as `wizard_local_db_server_port` | loopback |
//! | launcher | probed, published as `wizard_softwares_server_port` | loopback |
//! | subtask listener | 10231 | loopback |
//! | team server | 50333 | all interfaces |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WIZARD_PSQL_DNS` | - | `host:port:user:password` or JSON tuple |
//! | `WIZARD_REPOSITORY` | - | Repository name |
//! | `WIZARD_USER` | OS user | Artist name |
//! | `WIZARD_PROJECT` | - | Project name |
//! | `WIZARD_TEAM_DNS` | unset | Team server `host:port` |
//! | `WIZARD_TEAM_SECRET` | unset | Shared secret of the team server |
//! | `WIZARD_LOCAL_PATH` | temp dir | Export staging root |
//! | `WIZARD_PLUGINS_ROOT` | `<exe dir>/softwares` | DCC plugin folders |
//! | `WIZARD_PYTHON` | `python3` | Interpreter for scripts and hooks |
//! | `WIZARD_DATA_DIR` | `.data` | Subtask logs |
//!
//! # Modules
//!
//! - [`proxy`]: database proxy server and client
//! - [`catalog`]: typed access to the repository and project databases
//! - [`bridge`]: software-command bridge for DCC plugins
//! - [`launcher`]: DCC spawning, locking and lifecycle
//! - [`team`]: team broadcast server and client
//! - [`subtask`]: subtask runner and event listener
//! - [`env`]: session environment and the child environment map
//! - [`events`], [`tags`]: event log and `@user` mentions
//! - [`hooks`]: project hook dispatcher
//! - [`runtime`]: embeddable coordinator runtime

#![deny(missing_docs)]

/// Catalog schemas for repository and project databases.
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Session environment shared with child processes.
pub mod env;

/// Error types for coordinator operations.
pub mod error;

/// Typed catalog access.
pub mod catalog;

/// Local database proxy.
pub mod proxy;

/// Software-command bridge.
pub mod bridge;

/// Software launcher.
pub mod launcher;

/// Team broadcast server and client.
pub mod team;

/// Subtask runner.
pub mod subtask;

/// Project hooks.
pub mod hooks;

/// Event log.
pub mod events;

/// `@user` mentions in comments.
pub mod tags;

/// Handles shared by the request-serving components.
pub mod services;

/// Embeddable coordinator runtime.
pub mod runtime;

pub use config::Config;
pub use error::Error;
