// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for wizard-coordinator integration tests.
//!
//! Provides a `Studio` fixture: an in-memory catalog holding one project
//! with a single work environment, a temp project directory and the shared
//! services wired on top of them.

#![allow(dead_code, unused_macros)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use wizard_coordinator::catalog::{
    Asset, Catalog, Category, MemoryCatalog, NewVersion, ProjectSettings, Software, Stage,
    Variant, WorkEnv,
};
use wizard_coordinator::env::Environment;
use wizard_coordinator::hooks::HookDispatcher;
use wizard_coordinator::services::Services;

/// Skip a test unless a PostgreSQL test server is configured.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_WIZARD_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_WIZARD_DATABASE_URL not set");
            return;
        }
    };
}

/// Artist the fixture runs as.
pub const USER: &str = "lea";

/// Project of the fixture.
pub const PROJECT: &str = "forest";

/// A project with one work environment, backed by memory.
pub struct Studio {
    pub catalog: Arc<MemoryCatalog>,
    pub env: Arc<Environment>,
    pub services: Services,
    pub user_id: i64,
    pub asset_id: i64,
    pub stage_id: i64,
    pub variant_id: i64,
    pub software_id: i64,
    pub work_env_id: i64,
    pub project_path: PathBuf,
    pub local_path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl Studio {
    /// Studio whose DCC runs `script` through `/bin/sh`.
    pub async fn new(script: &str) -> Self {
        Self::with_hooks(script, |_| {}).await
    }

    /// Like [`new`](Self::new), registering in-process hooks first.
    pub async fn with_hooks(script: &str, setup: impl FnOnce(&mut HookDispatcher)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let project_path = temp_dir.path().join(PROJECT);
        let local_path = temp_dir.path().join("local");
        std::fs::create_dir_all(&project_path).expect("project dir");

        let catalog = Arc::new(MemoryCatalog::new());
        let user_id = catalog.add_user(USER).await;
        catalog.add_project(PROJECT, &project_path).await;
        catalog
            .set_settings(ProjectSettings {
                frame_rate: Some(24.0),
                image_format: serde_json::json!([1920, 1080]),
                users_ids: vec![user_id],
            })
            .await;

        let domain_id = catalog.add_domain("assets").await;
        let category_id = catalog
            .add_category(Category {
                id: 0,
                name: "characters".into(),
                domain_id,
                string: "assets/characters".into(),
            })
            .await;
        let asset_id = catalog
            .add_asset(Asset {
                id: 0,
                name: "hero".into(),
                category_id,
                inframe: 1001,
                outframe: 1100,
                preroll: 10,
                postroll: 5,
                string: "assets/characters/hero".into(),
            })
            .await;
        let stage_id = catalog
            .add_stage(Stage {
                id: 0,
                name: "rigging".into(),
                asset_id,
                string: "assets/characters/hero/rigging".into(),
                default_variant_id: None,
            })
            .await;
        let variant_id = catalog
            .add_variant(Variant {
                id: 0,
                name: "main".into(),
                stage_id,
                string: "assets/characters/hero/rigging/main".into(),
            })
            .await;
        let command = format!("[executable] -c '{script}'");
        let software_id = catalog
            .add_software(Software {
                id: 0,
                name: "blender".into(),
                extension: "blend".into(),
                path: Some("/bin/sh".into()),
                file_command: Some(command.clone()),
                no_file_command: Some(command.clone()),
                batch_file_command: Some(command.clone()),
                batch_no_file_command: Some(command),
                ..Default::default()
            })
            .await;
        let work_env_id = catalog
            .add_work_env(WorkEnv {
                id: 0,
                name: "blender".into(),
                variant_id,
                software_id,
                lock_id: None,
                export_extension: None,
                work_time: 0.0,
                string: "assets/characters/hero/rigging/main/blender".into(),
            })
            .await;

        let env = Arc::new(Environment::new());
        env.set_user(USER);
        env.set_project(PROJECT, &project_path);

        let mut hooks = HookDispatcher::new(env.clone(), "python3");
        setup(&mut hooks);

        let services = Services::new(env.clone(), catalog.clone(), Arc::new(hooks))
            .with_local_path(Some(local_path.clone()))
            .with_user_folder(temp_dir.path().join("user"))
            .with_plugins_root(temp_dir.path().join("softwares"));

        Self {
            catalog,
            env,
            services,
            user_id,
            asset_id,
            stage_id,
            variant_id,
            software_id,
            work_env_id,
            project_path,
            local_path,
            _temp_dir: temp_dir,
        }
    }

    /// Insert a version row for the work environment, returning its id.
    pub async fn add_version(&self, name: &str) -> i64 {
        let file_path = self
            .project_path
            .join("assets/characters/hero/rigging/main/blender")
            .join(format!("characters_hero_rigging_main.{name}.blend"));
        self.catalog
            .insert_version(NewVersion {
                name: name.into(),
                work_env_id: self.work_env_id,
                comment: String::new(),
                file_path: file_path.to_string_lossy().into_owned(),
                screenshot_path: String::new(),
                thumbnail_path: String::new(),
                string: format!("assets/characters/hero/rigging/main/blender/{name}"),
                creation_user: USER.into(),
            })
            .await
            .expect("insert version")
    }

    /// Current lock holder of the work environment.
    pub async fn lock_id(&self) -> Option<i64> {
        self.catalog
            .work_env(self.work_env_id)
            .await
            .expect("work env")
            .expect("work env exists")
            .lock_id
    }

    /// Write a file under the fixture's temp dir.
    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self._temp_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(&path, content).expect("write file");
        path
    }
}

/// Poll `check` every 20 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `path` lies under `root`.
pub fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}
