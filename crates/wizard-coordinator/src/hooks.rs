// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook dispatcher.
//!
//! Studios extend the pipeline with `wizard_hook.*` scripts dropped in the
//! project's `hooks/` directory or in any `plugins/<name>/` directory. They
//! are rediscovered on every trigger, so adding a script needs no restart.
//!
//! A script receives the event name as its first argument and a JSON object
//! with the event's arguments (plus `gui`) on stdin:
//!
//! ```text
//! $ python3 <project>/hooks/wizard_hook.py after_export <<< \
//!     '{"export_version_string": "...", "export_dir": "...", "stage_name": "modeling", "gui": false}'
//! ```
//!
//! Hooks run strictly after the operation that triggers them has been
//! persisted. A failing hook (error, non-zero exit, timeout or panic) is
//! logged and the next one runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::env::Environment;

/// Time a script hook may run before it is killed.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// File stem of hook scripts.
pub const HOOK_FILE_STEM: &str = "wizard_hook";

/// Extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// An export version was published.
    AfterExport,
    /// A category was created.
    AfterCategoryCreation,
    /// An asset was created.
    AfterAssetCreation,
    /// A stage was created.
    AfterStageCreation,
    /// A variant was created.
    AfterVariantCreation,
    /// A work environment was created.
    AfterWorkEnvironmentCreation,
    /// A work version was created.
    AfterWorkVersionCreation,
    /// A reference was created.
    AfterReferenceCreation,
}

impl HookEvent {
    /// Name passed to scripts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterExport => "after_export",
            Self::AfterCategoryCreation => "after_category_creation",
            Self::AfterAssetCreation => "after_asset_creation",
            Self::AfterStageCreation => "after_stage_creation",
            Self::AfterVariantCreation => "after_variant_creation",
            Self::AfterWorkEnvironmentCreation => "after_work_environment_creation",
            Self::AfterWorkVersionCreation => "after_work_version_creation",
            Self::AfterReferenceCreation => "after_reference_creation",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named string arguments of a hook call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookArgs {
    values: BTreeMap<String, String>,
    gui: bool,
}

impl HookArgs {
    /// Empty argument set.
    pub fn new(gui: bool) -> Self {
        Self {
            values: BTreeMap::new(),
            gui,
        }
    }

    /// Add an argument.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Argument by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Whether a GUI drives the coordinator.
    pub fn gui(&self) -> bool {
        self.gui
    }

    /// JSON object sent to scripts.
    pub fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        map.insert("gui".to_string(), Value::Bool(self.gui));
        Value::Object(map)
    }

    /// Arguments of `after_export`.
    pub fn after_export(
        gui: bool,
        export_version_string: &str,
        export_dir: &Path,
        stage_name: &str,
    ) -> Self {
        Self::new(gui)
            .with("export_version_string", export_version_string)
            .with("export_dir", export_dir.to_string_lossy())
            .with("stage_name", stage_name)
    }

    /// Arguments of `after_work_version_creation`.
    pub fn after_work_version_creation(
        gui: bool,
        string_work_version: &str,
        version_name: &str,
        file_name: &str,
    ) -> Self {
        Self::new(gui)
            .with("string_work_version", string_work_version)
            .with("version_name", version_name)
            .with("file_name", file_name)
    }

    /// Arguments of the `after_*_creation` events of the asset tree.
    pub fn after_creation(gui: bool, string: &str, name: &str) -> Self {
        Self::new(gui).with("string", string).with("name", name)
    }

    /// Arguments of `after_reference_creation`.
    pub fn after_reference_creation(
        gui: bool,
        string_work_environment: &str,
        string_referenced_export_version: &str,
        stage_name: &str,
        referenced_stage_name: &str,
    ) -> Self {
        Self::new(gui)
            .with("string_work_environment", string_work_environment)
            .with(
                "string_referenced_export_version",
                string_referenced_export_version,
            )
            .with("stage_name", stage_name)
            .with("referenced_stage_name", referenced_stage_name)
    }
}

/// Errors from a single hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// The script could not be started or fed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The script ran past its timeout and was killed.
    #[error("hook timed out after {0:?}")]
    Timeout(Duration),

    /// The script exited unsuccessfully.
    #[error("hook exited with {0}")]
    Exit(String),

    /// An in-process hook reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// One extension.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle an event.
    async fn call(&self, event: HookEvent, args: &HookArgs) -> Result<(), HookError>;
}

/// A discovered `wizard_hook.*` script run as a child process.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    path: PathBuf,
    name: String,
    python: String,
    timeout: Duration,
}

impl ScriptHook {
    /// Hook running `path`, with `python` for `.py` scripts.
    pub fn new(path: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.to_string_lossy().into_owned(),
            path,
            python: python.into(),
            timeout: HOOK_TIMEOUT,
        }
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Script path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self) -> Command {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("py") => {
                let mut cmd = Command::new(&self.python);
                cmd.arg(&self.path);
                cmd
            }
            Some("sh") => {
                let mut cmd = Command::new("sh");
                cmd.arg(&self.path);
                cmd
            }
            _ => Command::new(&self.path),
        }
    }
}

#[async_trait]
impl Hook for ScriptHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: HookEvent, args: &HookArgs) -> Result<(), HookError> {
        let mut child = self
            .command()
            .arg(event.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = args.to_json().to_string();
            // A script may exit without reading its input.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(hook = %self.name, error = %e, "Hook did not read its arguments");
            }
        }

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(HookError::Exit(status.to_string()))
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(HookError::Timeout(self.timeout))
            }
        }
    }
}

/// `wizard_hook.*` files under `<project>/hooks` and `<project>/plugins/*`.
///
/// The project hooks come first, then plugins in name order.
pub fn discover(project_path: &Path) -> Vec<PathBuf> {
    let mut found = find_hook_files(&project_path.join("hooks"));

    let mut plugin_dirs: Vec<PathBuf> = std::fs::read_dir(project_path.join("plugins"))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .filter(|path| {
                    !matches!(
                        path.file_name().and_then(|n| n.to_str()),
                        Some("__pycache__" | ".idea")
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    plugin_dirs.sort();

    for dir in plugin_dirs {
        found.extend(find_hook_files(&dir));
    }
    found
}

fn find_hook_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .filter(|path| path.file_stem().and_then(|s| s.to_str()) == Some(HOOK_FILE_STEM))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Runs every hook for an event, isolating failures.
pub struct HookDispatcher {
    env: Arc<Environment>,
    python: String,
    registered: Vec<Arc<dyn Hook>>,
    script_timeout: Duration,
}

impl HookDispatcher {
    /// Dispatcher discovering scripts in the environment's project.
    pub fn new(env: Arc<Environment>, python: impl Into<String>) -> Self {
        Self {
            env,
            python: python.into(),
            registered: Vec::new(),
            script_timeout: HOOK_TIMEOUT,
        }
    }

    /// Register an in-process hook; it runs before discovered scripts.
    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.registered.push(hook);
    }

    /// Override the script timeout.
    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Whether a GUI drives the coordinator.
    pub fn gui(&self) -> bool {
        self.env.gui()
    }

    fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        let mut hooks = self.registered.clone();
        if let Some(project_path) = self.env.project_path() {
            for path in discover(&project_path) {
                hooks.push(Arc::new(
                    ScriptHook::new(path, self.python.clone()).with_timeout(self.script_timeout),
                ));
            }
        }
        hooks
    }

    /// Run every hook for `event`; returns how many succeeded.
    pub async fn trigger(&self, event: HookEvent, args: HookArgs) -> usize {
        let args = Arc::new(args);
        let mut succeeded = 0;
        for hook in self.hooks() {
            let name = hook.name().to_string();
            info!(hook = %name, event = %event, "Executing hook");

            let task_args = args.clone();
            let outcome =
                tokio::spawn(async move { hook.call(event, &task_args).await }).await;
            match outcome {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => error!(hook = %name, event = %event, error = %e, "Hook failed"),
                Err(e) => error!(hook = %name, event = %event, error = %e, "Hook panicked"),
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Hook for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn call(&self, _event: HookEvent, _args: &HookArgs) -> Result<(), HookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HookError::Failed("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Hook for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn call(&self, _event: HookEvent, _args: &HookArgs) -> Result<(), HookError> {
            panic!("hook bug");
        }
    }

    #[test]
    fn test_args_json_includes_gui() {
        let args = HookArgs::after_export(true, "a/b/c", Path::new("/exp/0001"), "rigging");
        let json = args.to_json();
        assert_eq!(json["export_dir"], "/exp/0001");
        assert_eq!(json["stage_name"], "rigging");
        assert_eq!(json["gui"], true);
    }

    #[test]
    fn test_discover_orders_project_hooks_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("hooks")).unwrap();
        std::fs::create_dir_all(root.join("plugins/b_plugin")).unwrap();
        std::fs::create_dir_all(root.join("plugins/a_plugin")).unwrap();
        std::fs::create_dir_all(root.join("plugins/__pycache__")).unwrap();
        std::fs::write(root.join("hooks/wizard_hook.py"), "").unwrap();
        std::fs::write(root.join("hooks/other.py"), "").unwrap();
        std::fs::write(root.join("plugins/b_plugin/wizard_hook.sh"), "").unwrap();
        std::fs::write(root.join("plugins/a_plugin/wizard_hook.py"), "").unwrap();
        std::fs::write(root.join("plugins/__pycache__/wizard_hook.py"), "").unwrap();

        let found = discover(root);
        assert_eq!(
            found,
            vec![
                root.join("hooks/wizard_hook.py"),
                root.join("plugins/a_plugin/wizard_hook.py"),
                root.join("plugins/b_plugin/wizard_hook.sh"),
            ]
        );
    }

    #[test]
    fn test_discover_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let env = Arc::new(Environment::new());
        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let ok = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let mut dispatcher = HookDispatcher::new(env, "python3");
        dispatcher.register(failing.clone());
        dispatcher.register(Arc::new(Panicking));
        dispatcher.register(ok.clone());

        let succeeded = dispatcher
            .trigger(HookEvent::AfterAssetCreation, HookArgs::new(false))
            .await;
        assert_eq!(succeeded, 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_hook_receives_event_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = dir.path().join("wizard_hook.sh");
        std::fs::write(
            &script,
            format!("echo \"$1\" > {0}\ncat >> {0}\n", out.display()),
        )
        .unwrap();

        let hook = ScriptHook::new(&script, "python3");
        let args = HookArgs::after_creation(false, "assets/props", "props");
        hook.call(HookEvent::AfterCategoryCreation, &args)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("after_category_creation"));
        let payload: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(payload["name"], "props");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_hook_failure_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let failing = dir.path().join("fail.sh");
        std::fs::write(&failing, "exit 3\n").unwrap();
        let err = ScriptHook::new(&failing, "python3")
            .call(HookEvent::AfterExport, &HookArgs::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Exit(_)));

        let slow = dir.path().join("slow.sh");
        std::fs::write(&slow, "sleep 5\n").unwrap();
        let err = ScriptHook::new(&slow, "python3")
            .with_timeout(Duration::from_millis(100))
            .call(HookEvent::AfterExport, &HookArgs::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Timeout(_)));
    }
}
