// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Software launcher.
//!
//! Spawns DCCs on work versions. A launch locks the work environment for
//! the current user; a watcher task unlocks it, adds the session time to
//! `work_envs.work_time` and asks the team to refresh when the DCC exits.

pub mod command;
pub mod server;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

pub use command::LaunchMode;
pub use server::{LauncherClient, LauncherRequest, LauncherServer};

use crate::error::{Error, Result};
use crate::services::Services;
use command::{CommandInputs, EnvInputs, build_command, build_env};

/// Time a DCC gets to exit after SIGTERM before it is killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Stage whose first reference feeds Substance Painter's `[reference]`.
const REFERENCE_STAGE: &str = "modeling";

/// Why a launch was refused.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// Another user holds the work environment.
    #[error("work environment locked by {user}")]
    Locked {
        /// Holder of the lock.
        user: String,
    },

    /// The work environment is already open from this coordinator.
    #[error("work environment {0} already running")]
    AlreadyRunning(i64),

    /// The software has no usable executable.
    #[error("{software} executable not found{}", .path.as_ref().map(|p| format!(" ({})", p.display())).unwrap_or_default())]
    MissingExecutable {
        /// Software name.
        software: String,
        /// Configured path, when one is set.
        path: Option<PathBuf>,
    },

    /// The software has no command template for this launch.
    #[error("{software} has no command template for this launch")]
    MissingTemplate {
        /// Software name.
        software: String,
    },

    /// The child could not be started.
    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A prepared batch launch, handed to a subtask.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLaunch {
    /// Shell command line.
    pub command: String,
    /// Full environment of the child.
    pub env: BTreeMap<String, String>,
}

#[derive(Clone)]
struct RunningSoftware {
    software: String,
    kill: Arc<Notify>,
    exited: watch::Receiver<bool>,
}

/// Launches and tracks DCC children.
#[derive(Clone)]
pub struct Launcher {
    services: Services,
    running: Arc<Mutex<HashMap<i64, RunningSoftware>>>,
    kill_grace: Duration,
}

impl Launcher {
    /// Launcher over the shared services.
    pub fn new(services: Services) -> Self {
        Self {
            services,
            running: Arc::new(Mutex::new(HashMap::new())),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the SIGTERM grace period.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Work environments running from this coordinator, sorted.
    pub async fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn publish_running(&self) {
        let ids = self.running().await;
        self.services.env.set_running_work_envs(ids);
    }

    /// First file of the first modeling reference of a work environment.
    async fn modeling_reference(&self, work_env_id: i64) -> Result<Option<String>> {
        let mut by_stage = self.services.references_by_stage(work_env_id).await?;
        Ok(by_stage
            .remove(REFERENCE_STAGE)
            .and_then(|refs| refs.into_iter().next())
            .and_then(|r| r.files.into_iter().next()))
    }

    async fn prepare(
        &self,
        version_id: i64,
        mode: LaunchMode,
        extra_env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(i64, String, BatchLaunch)> {
        let s = &self.services;
        let version = s
            .catalog
            .version(version_id)
            .await?
            .ok_or_else(|| Error::not_found("version", version_id))?;
        let ctx = s.work_env_context(version.work_env_id).await?;

        let reference = if ctx.software.name == "substance_painter" {
            let reference = self.modeling_reference(ctx.work_env.id).await?;
            if reference.is_none() {
                warn!(work_env_id = ctx.work_env.id, "Create one modeling reference to launch Substance Painter");
            }
            reference
        } else {
            None
        };

        let file_path = PathBuf::from(&version.file_path);
        let command = build_command(&CommandInputs {
            software: &ctx.software,
            file_path: &file_path,
            reference: reference.as_deref(),
            plugins_root: &s.plugins_root,
            mode,
        })?;

        let mut base: BTreeMap<String, String> = std::env::vars().collect();
        base.extend(s.env.child_env());
        base.extend(extra_env);
        let hooks_folder = s.hooks_folder()?;
        let env = build_env(EnvInputs {
            base,
            context: &ctx,
            version_id,
            mode,
            plugins_root: &s.plugins_root,
            hooks_folder: &hooks_folder,
        });
        Ok((
            ctx.work_env.id,
            ctx.software.name.clone(),
            BatchLaunch { command, env },
        ))
    }

    /// Build the batch command of a version, for a subtask.
    ///
    /// `settings` is passed to the DCC as `wizard_json_settings`.
    pub async fn batch_command(&self, version_id: i64, settings: Option<&Value>) -> Result<BatchLaunch> {
        let extra = settings.map(|s| ("wizard_json_settings".to_string(), s.to_string()));
        let (_, _, launch) = self.prepare(version_id, LaunchMode::Batch, extra).await?;
        Ok(launch)
    }

    /// Open a work version in its DCC; returns the work environment id.
    pub async fn launch_work_version(&self, version_id: i64) -> Result<i64> {
        let s = &self.services;
        let version = s
            .catalog
            .version(version_id)
            .await?
            .ok_or_else(|| Error::not_found("version", version_id))?;
        let work_env_id = version.work_env_id;
        let work_env = s
            .catalog
            .work_env(work_env_id)
            .await?
            .ok_or_else(|| Error::not_found("work_env", work_env_id))?;

        let user_id = s.current_user_id().await?;
        if let Some(holder) = work_env.lock_id
            && holder != user_id
        {
            let user = s
                .catalog
                .user_name(holder)
                .await?
                .unwrap_or_else(|| format!("user {holder}"));
            warn!(work_env_id, locked_by = %user, "Work environment is locked");
            return Err(LaunchError::Locked { user }.into());
        }
        let (_, software, launch) = self.prepare(version_id, LaunchMode::Gui, None).await?;

        let kill = Arc::new(Notify::new());
        let (exited_tx, exited_rx) = watch::channel(false);
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&work_env_id) {
                warn!(work_env_id, "Work environment already running");
                return Err(LaunchError::AlreadyRunning(work_env_id).into());
            }
            running.insert(
                work_env_id,
                RunningSoftware {
                    software: software.clone(),
                    kill: kill.clone(),
                    exited: exited_rx,
                },
            );
        }

        let child = match self.start(work_env_id, user_id, &launch).await {
            Ok(child) => child,
            Err(e) => {
                self.running.lock().await.remove(&work_env_id);
                return Err(e);
            }
        };
        info!(work_env_id, version_id, software = %software, pid = child.id(), "Software launched");
        self.publish_running().await;

        let launcher = self.clone();
        tokio::spawn(async move {
            launcher
                .watch(work_env_id, software, child, kill, exited_tx)
                .await;
        });
        Ok(work_env_id)
    }

    /// Lock the work environment and spawn the DCC; the lock is released
    /// again when the spawn fails.
    async fn start(&self, work_env_id: i64, user_id: i64, launch: &BatchLaunch) -> Result<Child> {
        let s = &self.services;
        s.catalog.set_work_env_lock(work_env_id, Some(user_id)).await?;
        match spawn_shell(launch, &s.plugins_root) {
            Ok(child) => Ok(child),
            Err(e) => {
                if let Err(unlock) = s.catalog.set_work_env_lock(work_env_id, None).await {
                    error!(work_env_id, error = %unlock, "Failed to release lock after spawn failure");
                }
                Err(LaunchError::Spawn(e).into())
            }
        }
    }

    async fn watch(
        self,
        work_env_id: i64,
        software: String,
        mut child: Child,
        kill: Arc<Notify>,
        exited: watch::Sender<bool>,
    ) {
        let started = Instant::now();
        let killed = tokio::select! {
            status = child.wait() => {
                log_exit(work_env_id, &software, status);
                false
            }
            _ = kill.notified() => {
                terminate(&mut child, self.kill_grace).await;
                true
            }
        };
        let work_time = started.elapsed().as_secs_f64();

        self.running.lock().await.remove(&work_env_id);
        self.publish_running().await;

        let catalog = &self.services.catalog;
        if let Err(e) = catalog.set_work_env_lock(work_env_id, None).await {
            error!(work_env_id, error = %e, "Failed to unlock work environment");
        }
        if let Err(e) = catalog.add_work_time(work_env_id, work_time).await {
            error!(work_env_id, error = %e, "Failed to record work time");
        }
        info!(work_env_id, software = %software, killed, work_time, "Software closed");
        self.services.refresh_team().await;
        let _ = exited.send(true);
    }

    /// Stop the DCC of a work environment and wait for its cleanup.
    ///
    /// `false` when nothing runs there.
    pub async fn kill(&self, work_env_id: i64) -> bool {
        let Some(entry) = self.running.lock().await.get(&work_env_id).cloned() else {
            debug!(work_env_id, "Nothing to kill");
            return false;
        };
        info!(work_env_id, software = %entry.software, "Killing software");
        entry.kill.notify_one();
        let mut exited = entry.exited;
        let _ = exited.wait_for(|done| *done).await;
        true
    }

    /// Kill every running DCC; returns how many were stopped.
    pub async fn kill_all(&self) -> usize {
        let mut killed = 0;
        for work_env_id in self.running().await {
            if self.kill(work_env_id).await {
                killed += 1;
            }
        }
        killed
    }

    /// Release the locks the current user holds on work environments that
    /// are not running here, e.g. after a crash.
    pub async fn unlock_stale_locks(&self) -> Result<usize> {
        let s = &self.services;
        let user_id = s.current_user_id().await?;
        let running = self.running().await;
        let mut released = 0;
        for work_env_id in s.catalog.locked_work_envs(user_id).await? {
            if running.contains(&work_env_id) {
                continue;
            }
            s.catalog.set_work_env_lock(work_env_id, None).await?;
            released += 1;
        }
        if released > 0 {
            info!(released, "Released stale work environment locks");
        }
        Ok(released)
    }
}

/// Run `launch.command` through `sh`, replaced by the DCC via `exec`.
fn spawn_shell(launch: &BatchLaunch, cwd: &std::path::Path) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("exec {}", launch.command))
        .env_clear()
        .envs(&launch.env)
        .stdin(Stdio::null());
    if cwd.is_dir() {
        cmd.current_dir(cwd);
    }
    cmd.spawn()
}

fn log_exit(work_env_id: i64, software: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => debug!(work_env_id, software, "Software exited"),
        Ok(status) => warn!(work_env_id, software, %status, "Software exited with failure"),
        Err(e) => error!(work_env_id, software, error = %e, "Failed to wait for software"),
    }
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => debug!(pid, "Sent SIGTERM"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid, "Process already gone"),
            Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Software ignored SIGTERM, killing");
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after grace failed");
    }
}
