// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wizard Protocol - length-prefixed JSON over TCP
//!
//! This crate provides the wire layer shared by every link of the
//! coordination fabric:
//! - local callers and the database proxy
//! - DCC plugins and the software-command bridge
//! - the GUI and the software launcher
//! - desktop clients and the team broadcast server
//! - subtask runners and the subtask listener
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    wizard-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Calls: send_signal / send_bottle / send_signal_with_conn   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 big-endian length + UTF-8 JSON (serde_json)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP (tokio)                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Call styles
//!
//! | Call | Connection | Reply | Timeout |
//! |------|------------|-------|---------|
//! | `send_signal` | opened and closed per call | one frame | 200 s |
//! | `send_bottle` | opened and closed per call | none | 10 ms connect |
//! | `send_signal_with_conn` | caller-owned, stays open | none | - |
//!
//! Transport failures never surface as errors from these calls: they are
//! logged and reported as `None`/`false`.
//!
//! # Usage
//!
//! ```ignore
//! use serde_json::json;
//! use wizard_protocol::transport::{send_signal, Endpoint, SIGNAL_TIMEOUT};
//!
//! let reply = send_signal(
//!     &Endpoint::localhost(11111),
//!     &json!({"function": "add_version", "work_env_id": 42}),
//!     SIGNAL_TIMEOUT,
//! )
//! .await;
//! ```

pub mod frame;
pub mod server;
pub mod transport;

pub use frame::{Frame, FrameError, FramedStream};
pub use server::{BIND_RETRIES, FramedServer, FramedServerConfig, ServerError};
pub use transport::Endpoint;
