// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subtask runner.
//!
//! A subtask runs one shell command, reads its merged stdout/stderr line by
//! line and reports progress to a loopback listener as bottles of
//! `[process_id, kind, payload]`:
//!
//! | kind | payload |
//! |---|---|
//! | `status` | `"Running"`, then `"Done"` or `"Killed"` |
//! | `time` | whole seconds since start, `0` first |
//! | `percent` | float from a `wizard_task_percent:` line |
//! | `current_task` | text of a `wizard_task_name:` line |
//! | `stdout` | any other line |
//!
//! Delivery is at-most-once; events of one runner leave in order.

pub mod listener;
pub mod pycmd;
pub mod runner;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

pub use listener::BottleListener;
pub use pycmd::{build_pycmd, spawn_control_process};
pub use runner::{Subtask, SubtaskConfig, SubtaskHandle};

/// Line prefix reporting progress.
pub const PERCENT_MARKER: &str = "wizard_task_percent:";
/// Line prefix naming the current step.
pub const TASK_NAME_MARKER: &str = "wizard_task_name:";
/// Line prefix ending the task early (`wizard_task_status:done`).
pub const STATUS_MARKER: &str = "wizard_task_status:";

/// Subtask failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SubtaskError {
    /// Neither a command nor python code was given.
    #[error("no command to run")]
    NoCommand,

    /// The child could not be started.
    #[error("failed to spawn subtask: {0}")]
    Spawn(#[source] std::io::Error),

    /// A log, metadata or script file could not be written.
    #[error("subtask file error: {0}")]
    Io(#[from] std::io::Error),

    /// The environment lacks a key the command needs.
    #[error("environment key {0} is not set")]
    MissingEnv(&'static str),
}

/// Final or current state of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskStatus {
    /// Child started.
    Running,
    /// Child exited, whatever its code.
    Done,
    /// Child killed on request.
    Killed,
}

impl SubtaskStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Killed => "Killed",
        }
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a subtask event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventKind {
    Status,
    Percent,
    CurrentTask,
    Stdout,
    Time,
}

/// One progress event, `[process_id, kind, payload]` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, EventKind, Value)", into = "(String, EventKind, Value)")]
pub struct SubtaskEvent {
    /// Runner the event comes from.
    pub process_id: String,
    /// What the payload is.
    pub kind: EventKind,
    /// Event value.
    pub payload: Value,
}

impl From<(String, EventKind, Value)> for SubtaskEvent {
    fn from((process_id, kind, payload): (String, EventKind, Value)) -> Self {
        Self {
            process_id,
            kind,
            payload,
        }
    }
}

impl From<SubtaskEvent> for (String, EventKind, Value) {
    fn from(event: SubtaskEvent) -> Self {
        (event.process_id, event.kind, event.payload)
    }
}

impl SubtaskEvent {
    /// Event of `process_id`.
    pub fn new(process_id: &str, kind: EventKind, payload: Value) -> Self {
        Self {
            process_id: process_id.to_string(),
            kind,
            payload,
        }
    }

    /// Status event.
    pub fn status(process_id: &str, status: SubtaskStatus) -> Self {
        Self::new(process_id, EventKind::Status, json!(status.as_str()))
    }
}

/// What a line of child output means.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// Progress in percent.
    Percent(f64),
    /// Name of the current step.
    TaskName(String),
    /// The child declares itself done.
    Finished,
    /// Plain output.
    Stdout(String),
}

fn after_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|at| &line[at + marker.len()..])
}

/// Classify one line of child output.
///
/// A percent marker with an unparsable value is kept as plain output.
pub fn parse_line(line: &str) -> Line {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(value) = after_marker(line, PERCENT_MARKER) {
        return match value.trim().parse::<f64>() {
            Ok(percent) if percent.is_finite() => Line::Percent(percent.round()),
            _ => Line::Stdout(line.to_string()),
        };
    }
    if let Some(name) = after_marker(line, TASK_NAME_MARKER) {
        return Line::TaskName(name.trim().to_string());
    }
    if let Some(status) = after_marker(line, STATUS_MARKER)
        && status.trim() == "done"
    {
        return Line::Finished;
    }
    Line::Stdout(line.to_string())
}

static LAST_PROCESS_ID: AtomicU64 = AtomicU64::new(0);

/// Nanosecond timestamp, strictly increasing within the process.
pub fn next_process_id() -> String {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or_default();
    let mut last = LAST_PROCESS_ID.load(Ordering::Relaxed);
    loop {
        let id = now.max(last + 1);
        match LAST_PROCESS_ID.compare_exchange_weak(last, id, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return id.to_string(),
            Err(current) => last = current,
        }
    }
}
