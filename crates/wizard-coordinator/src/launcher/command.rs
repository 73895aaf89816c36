// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command lines and environments of DCC children.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::LaunchError;
use crate::catalog::Software;
use crate::services::WorkEnvContext;

/// Replaced by the software executable.
pub const EXECUTABLE_KEY: &str = "[executable]";
/// Replaced by the scene file.
pub const FILE_KEY: &str = "[file]";
/// Replaced by the plugin's startup script.
pub const SCRIPT_KEY: &str = "[startup_script]";
/// Replaced by the modeling reference (Substance Painter).
pub const REFERENCE_KEY: &str = "[reference]";

/// Separator of path lists in environment variables.
pub const PATH_LIST_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

/// Variables of the parent that must not leak into DCCs.
const STRIPPED_VARS: &[&str] = &[
    "QT_PLUGIN_PATH",
    "QML2_IMPORT_PATH",
    "QT_AUTO_SCREEN_SCALE_FACTOR",
    "QT_SCALE_FACTOR",
];

/// How the DCC is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Interactive session.
    Gui,
    /// Headless batch session.
    Batch,
}

impl LaunchMode {
    /// Value of `wizard_launch_mode`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gui => "gui",
            Self::Batch => "batch",
        }
    }
}

/// Environment variable the software reads its script paths from.
pub fn script_env_var(software: &str) -> &'static str {
    match software {
        "substance_painter" => "SUBSTANCE_PAINTER_PLUGINS_PATH",
        "substance_designer" => "SBS_DESIGNER_PYTHON_PATH",
        "nuke" => "NUKE_PATH",
        _ => "PYTHONPATH",
    }
}

/// `<plugins_root>/<software>_wizard`
pub fn plugin_path(plugins_root: &Path, software: &str) -> PathBuf {
    plugins_root.join(format!("{software}_wizard"))
}

/// Startup script the plugin runs when the DCC opens, if it has one.
pub fn startup_script(plugins_root: &Path, software: &str, mode: LaunchMode) -> Option<PathBuf> {
    let name = match (software, mode) {
        ("maya", LaunchMode::Gui) => "startup.mel",
        ("maya", LaunchMode::Batch) => "batch_startup.mel",
        ("guerilla_render" | "blender" | "houdini", LaunchMode::Gui) => "startup.py",
        ("guerilla_render" | "blender" | "houdini" | "nuke", LaunchMode::Batch) => {
            "batch_startup.py"
        }
        _ => return None,
    };
    Some(plugin_path(plugins_root, software).join(name))
}

/// Inputs of [`build_command`].
#[derive(Debug, Clone)]
pub struct CommandInputs<'a> {
    /// Software row with its templates.
    pub software: &'a Software,
    /// Scene file of the version.
    pub file_path: &'a Path,
    /// First modeling reference file, for Substance Painter.
    pub reference: Option<&'a str>,
    /// Root of the DCC plugin folders.
    pub plugins_root: &'a Path,
    /// Interactive or batch.
    pub mode: LaunchMode,
}

/// Fill the software's template for this launch.
///
/// The file template is used when the scene exists, the no-file one
/// otherwise.
pub fn build_command(inputs: &CommandInputs<'_>) -> Result<String, LaunchError> {
    let software = inputs.software;
    let executable = software_executable(software, inputs.mode)?;

    let file_exists = inputs.file_path.is_file();
    let template = match (inputs.mode, file_exists) {
        (LaunchMode::Gui, true) => software.file_command.as_deref(),
        (LaunchMode::Gui, false) => software.no_file_command.as_deref(),
        (LaunchMode::Batch, true) => software.batch_file_command.as_deref(),
        (LaunchMode::Batch, false) => software.batch_no_file_command.as_deref(),
    }
    .filter(|t| !t.trim().is_empty())
    .ok_or_else(|| LaunchError::MissingTemplate {
        software: software.name.clone(),
    })?;
    if !file_exists {
        debug!(file = %inputs.file_path.display(), "Scene missing, launching with an empty scene");
    }

    let mut command = template
        .replace(EXECUTABLE_KEY, &executable)
        .replace(FILE_KEY, &inputs.file_path.to_string_lossy());

    if command.contains(REFERENCE_KEY) {
        match inputs.reference {
            Some(reference) => command = command.replace(REFERENCE_KEY, &reference.replace('\\', "/")),
            None => warn!(software = %software.name, "No modeling reference to substitute"),
        }
    }
    if let Some(script) = startup_script(inputs.plugins_root, &software.name, inputs.mode) {
        command = command.replace(SCRIPT_KEY, &script.to_string_lossy());
    }
    Ok(command)
}

fn software_executable(software: &Software, mode: LaunchMode) -> Result<String, LaunchError> {
    let path = match mode {
        LaunchMode::Gui => software.path.as_deref(),
        LaunchMode::Batch => software.batch_path.as_deref().or(software.path.as_deref()),
    }
    .filter(|p| !p.is_empty())
    .ok_or_else(|| LaunchError::MissingExecutable {
        software: software.name.clone(),
        path: None,
    })?;
    if !Path::new(path).is_file() {
        return Err(LaunchError::MissingExecutable {
            software: software.name.clone(),
            path: Some(path.into()),
        });
    }
    Ok(path.to_string())
}

/// Extra script dirs: a JSON list, a JSON string or plain newline-separated text.
pub fn parse_additionnal_scripts(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    let text = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => {
            return items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(Value::String(s)) => s,
        _ => raw.to_string(),
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extra environment: a JSON object of strings.
pub fn parse_additionnal_env(raw: Option<&str>) -> BTreeMap<String, String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<BTreeMap<String, Value>>(raw) {
        Ok(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed additionnal_env");
            BTreeMap::new()
        }
    }
}

fn prepend_paths(env: &mut BTreeMap<String, String>, key: &str, paths: &[String]) {
    let mut parts: Vec<String> = paths.to_vec();
    if let Some(existing) = env.get(key).filter(|v| !v.is_empty()) {
        parts.push(existing.clone());
    }
    env.insert(key.to_string(), parts.join(PATH_LIST_SEPARATOR));
}

fn append_path(env: &mut BTreeMap<String, String>, key: &str, path: &str) {
    match env.get_mut(key) {
        Some(existing) if !existing.is_empty() => {
            existing.push_str(PATH_LIST_SEPARATOR);
            existing.push_str(path);
        }
        _ => {
            env.insert(key.to_string(), path.to_string());
        }
    }
}

/// Inputs of [`build_env`].
#[derive(Debug, Clone)]
pub struct EnvInputs<'a> {
    /// Parent environment plus the fabric's inherited keys.
    pub base: BTreeMap<String, String>,
    /// Work environment being launched.
    pub context: &'a WorkEnvContext,
    /// Version being launched.
    pub version_id: i64,
    /// Interactive or batch.
    pub mode: LaunchMode,
    /// Root of the DCC plugin folders.
    pub plugins_root: &'a Path,
    /// Project hooks folder.
    pub hooks_folder: &'a Path,
}

/// Environment map of a DCC child.
pub fn build_env(inputs: EnvInputs<'_>) -> BTreeMap<String, String> {
    let ctx = inputs.context;
    let software = ctx.software.name.as_str();
    let mut env = inputs.base;

    env.insert("wizard_launch_mode".into(), inputs.mode.as_str().into());
    env.insert("wizard_work_env_id".into(), ctx.work_env.id.to_string());
    env.insert("wizard_version_id".into(), inputs.version_id.to_string());
    env.insert("wizard_variant_name".into(), ctx.variant.name.clone());
    env.insert("wizard_stage_name".into(), ctx.stage.name.clone());
    env.insert("wizard_asset_name".into(), ctx.asset.name.clone());
    env.insert("wizard_category_name".into(), ctx.category.name.clone());

    let script_var = script_env_var(software);
    let plugin = plugin_path(inputs.plugins_root, software);
    let mut script_paths = vec![
        inputs.plugins_root.to_string_lossy().into_owned(),
        inputs.hooks_folder.to_string_lossy().into_owned(),
    ];
    if matches!(software, "substance_painter" | "nuke") {
        script_paths.push(plugin.to_string_lossy().into_owned());
    }
    prepend_paths(&mut env, script_var, &script_paths);

    match software {
        "houdini" => {
            env.insert(
                "HOUDINI_MENU_PATH".into(),
                format!("{};&", plugin.to_string_lossy()),
            );
        }
        "maya" => {
            env.remove("OCIO");
        }
        _ => {}
    }

    for path in parse_additionnal_scripts(ctx.software.additionnal_scripts.as_deref()) {
        append_path(&mut env, script_var, &path);
    }
    for (key, value) in parse_additionnal_env(ctx.software.additionnal_env.as_deref()) {
        append_path(&mut env, &key, &value);
    }
    for key in STRIPPED_VARS {
        env.remove(*key);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Asset, Category, Stage, Variant, WorkEnv};

    fn context(software: Software) -> WorkEnvContext {
        WorkEnvContext {
            work_env: WorkEnv {
                id: 14,
                name: software.name.clone(),
                variant_id: 2,
                software_id: software.id,
                lock_id: None,
                export_extension: None,
                work_time: 0.0,
                string: "assets/props/chair/modeling/main/maya".into(),
            },
            variant: Variant {
                id: 2,
                name: "main".into(),
                stage_id: 3,
                string: "assets/props/chair/modeling/main".into(),
            },
            stage: Stage {
                id: 3,
                name: "modeling".into(),
                asset_id: 4,
                string: "assets/props/chair/modeling".into(),
                default_variant_id: None,
            },
            asset: Asset {
                id: 4,
                name: "chair".into(),
                category_id: 5,
                inframe: 1001,
                outframe: 1100,
                preroll: 0,
                postroll: 0,
                string: "assets/props/chair".into(),
            },
            category: Category {
                id: 5,
                name: "props".into(),
                domain_id: 6,
                string: "assets/props".into(),
            },
            software,
        }
    }

    fn executable(dir: &Path) -> String {
        let exe = dir.join("dcc");
        std::fs::write(&exe, "").unwrap();
        exe.to_string_lossy().into_owned()
    }

    #[test]
    fn test_build_command_picks_template() {
        let dir = tempfile::tempdir().unwrap();
        let software = Software {
            name: "maya".into(),
            extension: "ma".into(),
            path: Some(executable(dir.path())),
            file_command: Some(r#""[executable]" -file "[file]" -script "[startup_script]""#.into()),
            no_file_command: Some(r#""[executable]" -script "[startup_script]""#.into()),
            ..Default::default()
        };
        let scene = dir.path().join("chair.0001.ma");
        let plugins = Path::new("/opt/wizard/softwares");
        let inputs = CommandInputs {
            software: &software,
            file_path: &scene,
            reference: None,
            plugins_root: plugins,
            mode: LaunchMode::Gui,
        };

        let command = build_command(&inputs).unwrap();
        assert!(!command.contains("-file"));
        assert!(command.ends_with("/opt/wizard/softwares/maya_wizard/startup.mel\""));

        std::fs::write(&scene, "").unwrap();
        let command = build_command(&inputs).unwrap();
        assert!(command.contains(&format!("-file \"{}\"", scene.display())));
    }

    #[test]
    fn test_missing_executable() {
        let software = Software {
            name: "nuke".into(),
            path: Some("/definitely/not/here/nuke".into()),
            file_command: Some("[executable] [file]".into()),
            no_file_command: Some("[executable]".into()),
            ..Default::default()
        };
        let err = build_command(&CommandInputs {
            software: &software,
            file_path: Path::new("/tmp/none.nk"),
            reference: None,
            plugins_root: Path::new("/s"),
            mode: LaunchMode::Gui,
        })
        .unwrap_err();
        assert!(matches!(err, LaunchError::MissingExecutable { path: Some(_), .. }));
    }

    #[test]
    fn test_reference_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let software = Software {
            name: "substance_painter".into(),
            path: Some(executable(dir.path())),
            no_file_command: Some(r#""[executable]" --mesh "[reference]""#.into()),
            ..Default::default()
        };
        let command = build_command(&CommandInputs {
            software: &software,
            file_path: Path::new("/none.spp"),
            reference: Some(r"C:\exports\chair.abc"),
            plugins_root: Path::new("/s"),
            mode: LaunchMode::Gui,
        })
        .unwrap();
        assert!(command.ends_with(r#"--mesh "C:/exports/chair.abc""#));
    }

    #[test]
    fn test_parse_additionnal_scripts() {
        assert_eq!(
            parse_additionnal_scripts(Some(r#"["/a", "", "/b"]"#)),
            vec!["/a", "/b"]
        );
        assert_eq!(
            parse_additionnal_scripts(Some(r#""/a\n/b""#)),
            vec!["/a", "/b"]
        );
        assert_eq!(parse_additionnal_scripts(Some("/x\n\n/y\n")), vec!["/x", "/y"]);
        assert!(parse_additionnal_scripts(None).is_empty());
    }

    #[test]
    fn test_build_env_maya() {
        let software = Software {
            id: 1,
            name: "maya".into(),
            additionnal_scripts: Some(r#"["/studio/scripts"]"#.into()),
            additionnal_env: Some(r#"{"MAYA_MODULE_PATH": "/studio/modules", "STUDIO": "1"}"#.into()),
            ..Default::default()
        };
        let ctx = context(software);
        let base = BTreeMap::from([
            ("OCIO".to_string(), "/cfg/ocio".to_string()),
            ("PYTHONPATH".to_string(), "/usr/lib/py".to_string()),
            ("MAYA_MODULE_PATH".to_string(), "/base".to_string()),
            ("QT_SCALE_FACTOR".to_string(), "2".to_string()),
        ]);

        let env = build_env(EnvInputs {
            base,
            context: &ctx,
            version_id: 77,
            mode: LaunchMode::Gui,
            plugins_root: Path::new("/opt/softwares"),
            hooks_folder: Path::new("/prod/forest/hooks"),
        });

        let sep = PATH_LIST_SEPARATOR;
        assert_eq!(env["wizard_work_env_id"], "14");
        assert_eq!(env["wizard_version_id"], "77");
        assert_eq!(env["wizard_launch_mode"], "gui");
        assert_eq!(env["wizard_asset_name"], "chair");
        assert_eq!(
            env["PYTHONPATH"],
            format!("/opt/softwares{sep}/prod/forest/hooks{sep}/usr/lib/py{sep}/studio/scripts")
        );
        assert_eq!(env["MAYA_MODULE_PATH"], format!("/base{sep}/studio/modules"));
        assert_eq!(env["STUDIO"], "1");
        assert!(!env.contains_key("OCIO"));
        assert!(!env.contains_key("QT_SCALE_FACTOR"));
    }

    #[test]
    fn test_build_env_houdini_menu_path() {
        let ctx = context(Software {
            name: "houdini".into(),
            ..Default::default()
        });
        let env = build_env(EnvInputs {
            base: BTreeMap::new(),
            context: &ctx,
            version_id: 1,
            mode: LaunchMode::Batch,
            plugins_root: Path::new("/opt/softwares"),
            hooks_folder: Path::new("/p/hooks"),
        });
        assert_eq!(env["HOUDINI_MENU_PATH"], "/opt/softwares/houdini_wizard;&");
        assert_eq!(env["wizard_launch_mode"], "batch");
    }
}
