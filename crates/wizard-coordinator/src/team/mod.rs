// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Presence and refresh signals shared across the artists of a project.

pub mod client;
pub mod server;

pub use client::{TeamClient, refresh_team, try_connection};
pub use server::{TeamRegistry, TeamServer, TeamServerConfig};
