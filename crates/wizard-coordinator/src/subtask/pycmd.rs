// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands that re-enter the coordinator.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use super::SubtaskError;
use crate::env::{Environment, REPOSITORY_PREFIX, keys};

/// Quote `s` for `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Command line running python `code` through `wizard_cmd` in the current
/// session.
///
/// `code` is used as is when it names an existing `.py` file; otherwise it
/// is written to a temporary script that is kept for the child.
pub fn build_pycmd(wizard_cmd: &Path, env: &Environment, code: &str) -> Result<String, SubtaskError> {
    let script = if code.ends_with(".py") && Path::new(code).is_file() {
        PathBuf::from(code)
    } else {
        let mut file = tempfile::Builder::new()
            .prefix("wizard_pycmd_")
            .suffix(".py")
            .tempfile()?;
        file.write_all(code.as_bytes())?;
        let (_, path) = file.keep().map_err(|e| SubtaskError::Io(e.error))?;
        path
    };

    let psql_dns = env.psql_dns().ok_or(SubtaskError::MissingEnv(keys::PSQL_DNS))?;
    let repository = env
        .repository()
        .ok_or(SubtaskError::MissingEnv(keys::REPOSITORY))?;
    let repository = repository
        .strip_prefix(REPOSITORY_PREFIX)
        .unwrap_or(&repository)
        .to_string();
    let user = env.user().ok_or(SubtaskError::MissingEnv(keys::USER))?;
    let project = env
        .project_name()
        .ok_or(SubtaskError::MissingEnv(keys::PROJECT_NAME))?;

    let mut parts = vec![
        shell_quote(&wizard_cmd.to_string_lossy()),
        "-psqlDns".into(),
        shell_quote(&psql_dns.to_json()),
        "-repository".into(),
        shell_quote(&repository),
        "-user".into(),
        shell_quote(&user),
        "-project".into(),
        shell_quote(&project),
    ];
    if let Some(team) = env.team_dns()
        && let Ok(team) = serde_json::to_string(&team)
    {
        parts.push("-teamDns".into());
        parts.push(shell_quote(&team));
    }
    parts.push("-pyfile".into());
    parts.push(shell_quote(&script.to_string_lossy()));
    Ok(parts.join(" "))
}

/// Start the `subtask` binary on `command`, detached from this process.
///
/// The control process outlives the coordinator; its pid is returned.
pub fn spawn_control_process(
    subtask_exe: &Path,
    command: &str,
    env: Option<&BTreeMap<String, String>>,
    cwd: Option<&Path>,
) -> Result<u32, SubtaskError> {
    let mut cmd = Command::new(subtask_exe);
    cmd.arg("-cmd").arg(command);
    if let Some(env) = env {
        let env = serde_json::to_string(env).map_err(std::io::Error::other)?;
        cmd.arg("-env").arg(env);
    }
    if let Some(cwd) = cwd {
        cmd.arg("-cwd").arg(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    let child = cmd.spawn().map_err(SubtaskError::Spawn)?;
    let pid = child.id().unwrap_or_default();
    info!(pid, command, "Subtask control process started");
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::PsqlDns;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-name_1"), "plain-name_1");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_build_pycmd() {
        let env = Environment::new();
        env.set_psql_dns(PsqlDns::new("db", 5432, "wizard", "pw"));
        env.set_repository("studio");
        env.set_user("lea");
        env.set_project("forest", "/prod/forest");

        let cmd = build_pycmd(Path::new("/opt/wizard/wizard_cmd"), &env, "print('hi')").unwrap();
        assert!(cmd.starts_with("/opt/wizard/wizard_cmd -psqlDns '"));
        assert!(cmd.contains("-repository studio -user lea -project forest"));
        assert!(!cmd.contains("-teamDns"));
        let script = cmd.rsplit(' ').next().unwrap();
        assert_eq!(std::fs::read_to_string(script).unwrap(), "print('hi')");
        std::fs::remove_file(script).unwrap();
    }

    #[test]
    fn test_build_pycmd_needs_session() {
        let err = build_pycmd(Path::new("wizard_cmd"), &Environment::new(), "pass");
        assert!(matches!(err, Err(SubtaskError::MissingEnv(_))));
    }
}
