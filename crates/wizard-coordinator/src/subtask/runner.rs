// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Running one subtask.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use wizard_protocol::Endpoint;
use wizard_protocol::transport::send_bottle;

use super::{EventKind, Line, SubtaskError, SubtaskEvent, SubtaskStatus, next_process_id, parse_line};

/// Where the subtask runs and reports.
#[derive(Debug, Clone)]
pub struct SubtaskConfig {
    /// Shell command line.
    pub command: String,
    /// Working directory; the current one when unset.
    pub cwd: Option<PathBuf>,
    /// Full environment of the child; the parent's when unset.
    pub env: Option<BTreeMap<String, String>>,
    /// Listener receiving the events.
    pub listener: Endpoint,
    /// Directory receiving `subtasks/subtask_<id>.{log,json}`.
    pub data_dir: Option<PathBuf>,
    /// Mirror child output lines on our stdout.
    pub print_stdout: bool,
}

impl SubtaskConfig {
    /// `command` reporting to the listener on loopback `port`.
    pub fn new(command: impl Into<String>, port: u16) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: None,
            listener: Endpoint::localhost(port),
            data_dir: None,
            print_stdout: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    process_id: &'a str,
    command: &'a str,
    cwd: Option<&'a Path>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: SubtaskStatus,
    current_task: &'a str,
    percent: f64,
}

/// Entry point for starting subtasks.
pub struct Subtask;

impl Subtask {
    /// Start `config.command` and its pumps.
    pub async fn spawn(config: SubtaskConfig) -> Result<SubtaskHandle, SubtaskError> {
        if config.command.trim().is_empty() {
            return Err(SubtaskError::NoCommand);
        }
        let process_id = next_process_id();

        let mut env: BTreeMap<String, String> = config
            .env
            .clone()
            .unwrap_or_else(|| std::env::vars().collect());
        env.entry("PYTHONUNBUFFERED".to_string())
            .or_insert_with(|| "1".to_string());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", config.command))
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(SubtaskError::Spawn)?;
        info!(process_id = %process_id, command = %config.command, pid = child.id(), "Subtask started");

        let stdin = child.stdin.take();
        let kill = Arc::new(Notify::new());
        let task = tokio::spawn(supervise(
            config,
            process_id.clone(),
            child,
            kill.clone(),
        ));
        Ok(SubtaskHandle {
            process_id,
            stdin: Mutex::new(stdin),
            kill,
            task: Mutex::new(Some(task)),
        })
    }
}

/// A running subtask.
pub struct SubtaskHandle {
    process_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    kill: Arc<Notify>,
    task: Mutex<Option<JoinHandle<SubtaskStatus>>>,
}

impl SubtaskHandle {
    /// Identifier carried by every event.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Send one line to the child's stdin.
    ///
    /// Failures are logged; the child keeps running.
    pub async fn write_stdin(&self, line: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            warn!(process_id = %self.process_id, "Subtask stdin is closed");
            return false;
        };
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        let result = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(process_id = %self.process_id, error = %e, "Failed to write to subtask stdin");
                false
            }
        }
    }

    /// Kill the child and everything it started.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Wait for the end of the subtask; the status it ended with.
    ///
    /// Later calls return [`SubtaskStatus::Done`] right away.
    pub async fn wait(&self) -> SubtaskStatus {
        let Some(task) = self.task.lock().await.take() else {
            return SubtaskStatus::Done;
        };
        match task.await {
            Ok(status) => status,
            Err(e) => {
                error!(process_id = %self.process_id, error = %e, "Subtask supervisor failed");
                SubtaskStatus::Done
            }
        }
    }
}

/// Sends the events of one runner in order, and keeps the log.
async fn emit_events(
    listener: Endpoint,
    mut events: mpsc::UnboundedReceiver<SubtaskEvent>,
    mut log: Option<tokio::fs::File>,
    print_stdout: bool,
) {
    while let Some(event) = events.recv().await {
        if event.kind == EventKind::Stdout
            && let Some(line) = event.payload.as_str()
        {
            if print_stdout {
                println!("{line}");
            }
            if let Some(file) = log.as_mut()
                && let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await
            {
                warn!(error = %e, "Subtask log write failed, log disabled");
                log = None;
            }
        }
        match serde_json::to_value(&event) {
            Ok(message) => {
                if !send_bottle(&listener, &message).await {
                    debug!(kind = ?event.kind, "Subtask event dropped");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode subtask event"),
        }
    }
    if let Some(mut file) = log
        && let Err(e) = file.flush().await
    {
        warn!(error = %e, "Failed to flush subtask log");
    }
}

#[instrument(skip_all, fields(process_id = %process_id))]
async fn supervise(
    config: SubtaskConfig,
    process_id: String,
    mut child: Child,
    kill: Arc<Notify>,
) -> SubtaskStatus {
    let start_time = Utc::now();
    let files = match &config.data_dir {
        Some(dir) => match prepare_files(dir, &process_id).await {
            Ok(files) => Some(files),
            Err(e) => {
                warn!(error = %e, "Subtask files unavailable");
                None
            }
        },
        None => None,
    };
    let log = match &files {
        Some((log_path, _)) => tokio::fs::File::create(log_path)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to create subtask log"))
            .ok(),
        None => None,
    };

    let (events, rx) = mpsc::unbounded_channel();
    let emitter = tokio::spawn(emit_events(
        config.listener.clone(),
        rx,
        log,
        config.print_stdout,
    ));
    let send = |kind: EventKind, payload: serde_json::Value| {
        let _ = events.send(SubtaskEvent::new(&process_id, kind, payload));
    };

    let mut current_task = String::new();
    let mut percent = 0.0;
    let mut metadata = Metadata {
        process_id: &process_id,
        command: &config.command,
        cwd: config.cwd.as_deref(),
        start_time,
        end_time: None,
        status: SubtaskStatus::Running,
        current_task: "",
        percent,
    };
    if let Some((_, json_path)) = &files {
        write_metadata(json_path, &metadata).await;
    }

    let _ = events.send(SubtaskEvent::status(&process_id, SubtaskStatus::Running));
    let mut clock = tokio::time::interval(Duration::from_secs(1));
    let mut elapsed: u64 = 0;
    clock.tick().await;
    send(EventKind::Time, json!(0));

    let mut lines = child
        .stdout
        .take()
        .map(|stdout| BufReader::new(stdout).lines());

    let status = loop {
        tokio::select! {
            _ = clock.tick() => {
                elapsed += 1;
                send(EventKind::Time, json!(elapsed));
            }
            _ = kill.notified() => {
                kill_group(&mut child).await;
                break SubtaskStatus::Killed;
            }
            line = next_line(&mut lines) => match line {
                Some(line) => match parse_line(&line) {
                    Line::Percent(value) => {
                        percent = value;
                        send(EventKind::Percent, json!(value));
                    }
                    Line::TaskName(name) => {
                        send(EventKind::CurrentTask, json!(name));
                        current_task = name;
                    }
                    Line::Finished => {
                        debug!("Child reported done");
                        kill_group(&mut child).await;
                        break SubtaskStatus::Done;
                    }
                    Line::Stdout(text) => send(EventKind::Stdout, json!(text)),
                },
                None => {
                    match child.wait().await {
                        Ok(status) => debug!(%status, "Subtask child exited"),
                        Err(e) => error!(error = %e, "Failed to wait for subtask child"),
                    }
                    break SubtaskStatus::Done;
                }
            },
        }
    };

    let _ = events.send(SubtaskEvent::status(&process_id, status));
    drop(events);
    if let Err(e) = emitter.await {
        error!(error = %e, "Subtask emitter failed");
    }

    metadata.end_time = Some(Utc::now());
    metadata.status = status;
    metadata.current_task = &current_task;
    metadata.percent = percent;
    if let Some((_, json_path)) = &files {
        write_metadata(json_path, &metadata).await;
    }
    info!(%status, "Subtask finished");
    status
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
) -> Option<String> {
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Subtask output unreadable");
            None
        }
    }
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "Killed subtask process group"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid, "Subtask already gone"),
            Err(e) => warn!(pid, error = %e, "Failed to kill subtask process group"),
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Subtask child already reaped");
    }
}

async fn prepare_files(data_dir: &Path, process_id: &str) -> std::io::Result<(PathBuf, PathBuf)> {
    let dir = data_dir.join("subtasks");
    tokio::fs::create_dir_all(&dir).await?;
    Ok((
        dir.join(format!("subtask_{process_id}.log")),
        dir.join(format!("subtask_{process_id}.json")),
    ))
}

async fn write_metadata(path: &Path, metadata: &Metadata<'_>) {
    let body = match serde_json::to_vec_pretty(metadata) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode subtask metadata");
            return;
        }
    };
    if let Err(e) = tokio::fs::write(path, body).await {
        warn!(path = %path.display(), error = %e, "Failed to write subtask metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = Subtask::spawn(SubtaskConfig::new("  ", 1)).await.err();
        assert!(matches!(err, Some(SubtaskError::NoCommand)));
    }

    #[tokio::test]
    async fn test_wait_twice() {
        let handle = Subtask::spawn(SubtaskConfig::new("true", 1)).await.unwrap();
        assert_eq!(handle.wait().await, SubtaskStatus::Done);
        assert_eq!(handle.wait().await, SubtaskStatus::Done);
    }

    #[tokio::test]
    async fn test_writes_log_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SubtaskConfig::new("echo first; echo oops >&2", 1);
        config.data_dir = Some(dir.path().to_path_buf());
        let handle = Subtask::spawn(config).await.unwrap();
        let id = handle.process_id().to_string();
        assert_eq!(handle.wait().await, SubtaskStatus::Done);

        let log = std::fs::read_to_string(dir.path().join(format!("subtasks/subtask_{id}.log")))
            .unwrap();
        assert_eq!(log, "first\noops\n");
        let meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(format!("subtasks/subtask_{id}.json"))).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["status"], "Done");
        assert_eq!(meta["command"], "echo first; echo oops >&2");
        assert!(meta["end_time"].is_string());
    }
}
