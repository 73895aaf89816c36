// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory catalog for testing.
//!
//! Holds rows in plain maps so bridge, launcher and tag logic can be
//! exercised without PostgreSQL.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::error::{Error, Result};

/// Stored event with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Row id.
    pub id: i64,
    /// Event as inserted.
    pub event: NewEvent,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    users: BTreeMap<i64, User>,
    projects: HashMap<String, PathBuf>,
    settings: ProjectSettings,
    categories: BTreeMap<i64, Category>,
    assets: BTreeMap<i64, Asset>,
    stages: BTreeMap<i64, Stage>,
    variants: BTreeMap<i64, Variant>,
    work_envs: BTreeMap<i64, WorkEnv>,
    versions: BTreeMap<i64, Version>,
    softwares: BTreeMap<i64, Software>,
    exports: BTreeMap<i64, Export>,
    export_versions: BTreeMap<i64, ExportVersion>,
    references: BTreeMap<i64, Reference>,
    events: Vec<StoredEvent>,
    domains: BTreeMap<i64, String>,
}

impl MemoryState {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`Catalog`] keeping every row in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
    /// When set, every write fails as if the proxy were down.
    pub fail_writes: bool,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog whose writes all fail.
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes {
            Err(Error::CatalogUnavailable("memory catalog write".into()))
        } else {
            Ok(())
        }
    }

    /// Add a repository user, returning its id.
    pub async fn add_user(&self, user_name: &str) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.id();
        state.users.insert(
            id,
            User {
                id,
                user_name: user_name.to_string(),
            },
        );
        id
    }

    /// Register a project path.
    pub async fn add_project(&self, name: &str, path: impl Into<PathBuf>) {
        self.state
            .lock()
            .await
            .projects
            .insert(name.to_string(), path.into());
    }

    /// Replace the project settings.
    pub async fn set_settings(&self, settings: ProjectSettings) {
        self.state.lock().await.settings = settings;
    }

    /// Add a domain with its `string`, returning its id.
    pub async fn add_domain(&self, string: &str) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.id();
        state.domains.insert(id, string.to_string());
        id
    }

    /// Add a category; its id is assigned.
    pub async fn add_category(&self, mut row: Category) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.categories.insert(id, row);
        id
    }

    /// Add an asset; its id is assigned.
    pub async fn add_asset(&self, mut row: Asset) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.assets.insert(id, row);
        id
    }

    /// Add a stage; its id is assigned.
    pub async fn add_stage(&self, mut row: Stage) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.stages.insert(id, row);
        id
    }

    /// Add a variant; its id is assigned.
    pub async fn add_variant(&self, mut row: Variant) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.variants.insert(id, row);
        id
    }

    /// Add a software; its id is assigned.
    pub async fn add_software(&self, mut row: Software) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.softwares.insert(id, row);
        id
    }

    /// Add a work environment; its id is assigned.
    pub async fn add_work_env(&self, mut row: WorkEnv) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.work_envs.insert(id, row);
        id
    }

    /// Add an export; its id is assigned.
    pub async fn add_export(&self, mut row: Export) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.exports.insert(id, row);
        id
    }

    /// Add a reference; its id is assigned.
    pub async fn add_reference(&self, mut row: Reference) -> i64 {
        let mut state = self.state.lock().await;
        row.id = state.id();
        let id = row.id;
        state.references.insert(id, row);
        id
    }

    /// Every event written so far.
    pub async fn events(&self) -> Vec<StoredEvent> {
        self.state.lock().await.events.clone()
    }

    /// Every version of a work environment, oldest first.
    pub async fn versions_of(&self, work_env_id: i64) -> Vec<Version> {
        self.state
            .lock()
            .await
            .versions
            .values()
            .filter(|v| v.work_env_id == work_env_id)
            .cloned()
            .collect()
    }

    /// Look up a reference.
    pub async fn reference(&self, id: i64) -> Option<Reference> {
        self.state.lock().await.references.get(&id).cloned()
    }

    /// Every export version, oldest first.
    pub async fn export_versions(&self) -> Vec<ExportVersion> {
        self.state
            .lock()
            .await
            .export_versions
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn user_id(&self, user_name: &str) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.user_name == user_name)
            .map(|u| u.id))
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(|u| u.user_name.clone()))
    }

    async fn users(&self) -> Result<Vec<User>> {
        Ok(self.state.lock().await.users.values().cloned().collect())
    }

    async fn project_path(&self, project_name: &str) -> Result<Option<PathBuf>> {
        Ok(self.state.lock().await.projects.get(project_name).cloned())
    }

    async fn project_settings(&self) -> Result<ProjectSettings> {
        Ok(self.state.lock().await.settings.clone())
    }

    async fn category(&self, id: i64) -> Result<Option<Category>> {
        Ok(self.state.lock().await.categories.get(&id).cloned())
    }

    async fn asset(&self, id: i64) -> Result<Option<Asset>> {
        Ok(self.state.lock().await.assets.get(&id).cloned())
    }

    async fn stage(&self, id: i64) -> Result<Option<Stage>> {
        Ok(self.state.lock().await.stages.get(&id).cloned())
    }

    async fn variant(&self, id: i64) -> Result<Option<Variant>> {
        Ok(self.state.lock().await.variants.get(&id).cloned())
    }

    async fn work_env(&self, id: i64) -> Result<Option<WorkEnv>> {
        Ok(self.state.lock().await.work_envs.get(&id).cloned())
    }

    async fn version(&self, id: i64) -> Result<Option<Version>> {
        Ok(self.state.lock().await.versions.get(&id).cloned())
    }

    async fn last_version(&self, work_env_id: i64) -> Result<Option<Version>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .values()
            .filter(|v| v.work_env_id == work_env_id)
            .max_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn software(&self, id: i64) -> Result<Option<Software>> {
        Ok(self.state.lock().await.softwares.get(&id).cloned())
    }

    async fn export(&self, id: i64) -> Result<Option<Export>> {
        Ok(self.state.lock().await.exports.get(&id).cloned())
    }

    async fn export_by_name(&self, variant_id: i64, name: &str) -> Result<Option<Export>> {
        let state = self.state.lock().await;
        Ok(state
            .exports
            .values()
            .find(|e| e.variant_id == variant_id && e.name == name)
            .cloned())
    }

    async fn export_version(&self, id: i64) -> Result<Option<ExportVersion>> {
        Ok(self.state.lock().await.export_versions.get(&id).cloned())
    }

    async fn last_export_version(&self, export_id: i64) -> Result<Option<ExportVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .export_versions
            .values()
            .filter(|v| v.export_id == export_id)
            .max_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn insert_version(&self, version: NewVersion) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.versions.insert(
            id,
            Version {
                id,
                name: version.name,
                work_env_id: version.work_env_id,
                comment: Some(version.comment),
                file_path: version.file_path,
                screenshot_path: Some(version.screenshot_path),
                thumbnail_path: Some(version.thumbnail_path),
                string: version.string,
                creation_user: Some(version.creation_user),
            },
        );
        Ok(id)
    }

    async fn insert_export(&self, export: NewExport) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.exports.insert(
            id,
            Export {
                id,
                name: export.name,
                variant_id: export.variant_id,
                string: export.string,
                default_export_version: None,
            },
        );
        Ok(id)
    }

    async fn insert_export_version(&self, version: NewExportVersion) -> Result<i64> {
        self.check_write()?;
        let files = serde_json::to_string(&version.files)?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.export_versions.insert(
            id,
            ExportVersion {
                id,
                name: version.name,
                export_id: version.export_id,
                variant_id: version.variant_id,
                work_version_id: version.work_version_id,
                work_version_thumbnail_path: version.work_version_thumbnail_path,
                software: version.software,
                comment: Some(version.comment),
                files,
                string: version.string,
                creation_user: Some(version.creation_user),
            },
        );
        Ok(id)
    }

    async fn set_work_env_lock(&self, work_env_id: i64, user_id: Option<i64>) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let work_env = state
            .work_envs
            .get_mut(&work_env_id)
            .ok_or_else(|| Error::not_found("work_env", work_env_id))?;
        work_env.lock_id = user_id;
        Ok(())
    }

    async fn add_work_time(&self, work_env_id: i64, seconds: f64) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let work_env = state
            .work_envs
            .get_mut(&work_env_id)
            .ok_or_else(|| Error::not_found("work_env", work_env_id))?;
        work_env.work_time += seconds;
        Ok(())
    }

    async fn locked_work_envs(&self, user_id: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .work_envs
            .values()
            .filter(|w| w.lock_id == Some(user_id))
            .map(|w| w.id)
            .collect())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.events.push(StoredEvent { id, event });
        Ok(id)
    }

    async fn instance_string(&self, kind: InstanceKind, id: i64) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(match kind {
            InstanceKind::Domain => state.domains.get(&id).cloned(),
            InstanceKind::Category => state.categories.get(&id).map(|r| r.string.clone()),
            InstanceKind::Asset => state.assets.get(&id).map(|r| r.string.clone()),
            InstanceKind::Stage => state.stages.get(&id).map(|r| r.string.clone()),
            InstanceKind::Variant => state.variants.get(&id).map(|r| r.string.clone()),
            InstanceKind::WorkEnv => state.work_envs.get(&id).map(|r| r.string.clone()),
            InstanceKind::WorkVersion => state.versions.get(&id).map(|r| r.string.clone()),
            InstanceKind::Export => state.exports.get(&id).map(|r| r.string.clone()),
            InstanceKind::ExportVersion => {
                state.export_versions.get(&id).map(|r| r.string.clone())
            }
        })
    }

    async fn set_event_message(&self, event_id: i64, message: &str) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let stored = state
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::not_found("event", event_id))?;
        stored.event.message = message.to_string();
        Ok(())
    }

    async fn references(&self, work_env_id: i64) -> Result<Vec<Reference>> {
        let state = self.state.lock().await;
        Ok(state
            .references
            .values()
            .filter(|r| r.work_env_id == work_env_id)
            .cloned()
            .collect())
    }

    async fn set_reference_export(
        &self,
        reference_id: i64,
        export_id: i64,
        export_version_id: i64,
    ) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let reference = state
            .references
            .get_mut(&reference_id)
            .ok_or_else(|| Error::not_found("reference", reference_id))?;
        reference.export_id = export_id;
        reference.export_version_id = Some(export_version_id);
        Ok(())
    }

    async fn variant_exports(&self, variant_id: i64) -> Result<Vec<Export>> {
        let state = self.state.lock().await;
        Ok(state
            .exports
            .values()
            .filter(|e| e.variant_id == variant_id)
            .cloned()
            .collect())
    }

    async fn stage_by_name(&self, asset_id: i64, name: &str) -> Result<Option<Stage>> {
        let state = self.state.lock().await;
        Ok(state
            .stages
            .values()
            .find(|st| st.asset_id == asset_id && st.name == name)
            .cloned())
    }

    async fn work_env_by_name(&self, variant_id: i64, name: &str) -> Result<Option<WorkEnv>> {
        let state = self.state.lock().await;
        Ok(state
            .work_envs
            .values()
            .find(|w| w.variant_id == variant_id && w.name == name)
            .cloned())
    }

    async fn software_by_name(&self, name: &str) -> Result<Option<Software>> {
        let state = self.state.lock().await;
        Ok(state.softwares.values().find(|sw| sw.name == name).cloned())
    }

    async fn insert_stage(&self, stage: NewStage) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.stages.insert(
            id,
            Stage {
                id,
                name: stage.name,
                asset_id: stage.asset_id,
                string: stage.string,
                default_variant_id: None,
            },
        );
        Ok(id)
    }

    async fn insert_variant(&self, variant: NewVariant) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.variants.insert(
            id,
            Variant {
                id,
                name: variant.name,
                stage_id: variant.stage_id,
                string: variant.string,
            },
        );
        Ok(id)
    }

    async fn set_stage_default_variant(&self, stage_id: i64, variant_id: i64) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let stage = state
            .stages
            .get_mut(&stage_id)
            .ok_or_else(|| Error::not_found("stage", stage_id))?;
        stage.default_variant_id = Some(variant_id);
        Ok(())
    }

    async fn insert_work_env(&self, work_env: NewWorkEnv) -> Result<i64> {
        self.check_write()?;
        let mut state = self.state.lock().await;
        let id = state.id();
        state.work_envs.insert(
            id,
            WorkEnv {
                id,
                name: work_env.name,
                variant_id: work_env.variant_id,
                software_id: work_env.software_id,
                lock_id: None,
                export_extension: work_env.export_extension,
                work_time: 0.0,
                string: work_env.string,
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_env(variant_id: i64) -> WorkEnv {
        WorkEnv {
            id: 0,
            name: "maya".into(),
            variant_id,
            software_id: 1,
            lock_id: None,
            export_extension: None,
            work_time: 0.0,
            string: "assets/props/chair/modeling/main/maya".into(),
        }
    }

    #[tokio::test]
    async fn test_locks_and_work_time() {
        let catalog = MemoryCatalog::new();
        let user = catalog.add_user("lea").await;
        let id = catalog.add_work_env(work_env(1)).await;

        catalog.set_work_env_lock(id, Some(user)).await.unwrap();
        assert_eq!(catalog.locked_work_envs(user).await.unwrap(), vec![id]);

        catalog.add_work_time(id, 12.0).await.unwrap();
        catalog.add_work_time(id, 3.0).await.unwrap();
        catalog.set_work_env_lock(id, None).await.unwrap();

        let row = catalog.work_env(id).await.unwrap().unwrap();
        assert_eq!(row.lock_id, None);
        assert_eq!(row.work_time, 15.0);
    }

    #[tokio::test]
    async fn test_last_version_orders_by_name() {
        let catalog = MemoryCatalog::new();
        for name in ["0002", "0001", "0010"] {
            catalog
                .insert_version(NewVersion {
                    name: name.into(),
                    work_env_id: 5,
                    comment: String::new(),
                    file_path: format!("/p/{name}"),
                    screenshot_path: String::new(),
                    thumbnail_path: String::new(),
                    string: String::new(),
                    creation_user: "lea".into(),
                })
                .await
                .unwrap();
        }
        let last = catalog.last_version(5).await.unwrap().unwrap();
        assert_eq!(last.name, "0010");
        assert!(catalog.last_version(6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let catalog = MemoryCatalog::failing_writes();
        let result = catalog.add_work_time(1, 1.0).await;
        assert!(matches!(result, Err(Error::CatalogUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_work_env_is_not_found() {
        let catalog = MemoryCatalog::new();
        let result = catalog.set_work_env_lock(99, None).await;
        assert!(matches!(result, Err(Error::NotFound { kind: "work_env", .. })));
    }

    #[tokio::test]
    async fn test_new_stage_takes_a_default_variant() {
        let catalog = MemoryCatalog::new();
        let stage_id = catalog
            .insert_stage(NewStage {
                name: "camera".into(),
                asset_id: 7,
                string: "assets/props/chair/camera".into(),
                creation_user: "lea".into(),
            })
            .await
            .unwrap();
        let stage = catalog.stage_by_name(7, "camera").await.unwrap().unwrap();
        assert_eq!(stage.id, stage_id);
        assert_eq!(stage.default_variant_id, None);
        assert!(catalog.stage_by_name(8, "camera").await.unwrap().is_none());

        let variant_id = catalog
            .insert_variant(NewVariant {
                name: "main".into(),
                stage_id,
                comment: "default variant".into(),
                string: "assets/props/chair/camera/main".into(),
                creation_user: "lea".into(),
            })
            .await
            .unwrap();
        catalog
            .set_stage_default_variant(stage_id, variant_id)
            .await
            .unwrap();
        let stage = catalog.stage(stage_id).await.unwrap().unwrap();
        assert_eq!(stage.default_variant_id, Some(variant_id));

        let work_env_id = catalog
            .insert_work_env(NewWorkEnv {
                name: "maya".into(),
                variant_id,
                software_id: 1,
                export_extension: None,
                string: "assets/props/chair/camera/main/maya".into(),
                creation_user: "lea".into(),
            })
            .await
            .unwrap();
        let found = catalog
            .work_env_by_name(variant_id, "maya")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, work_env_id);
        assert_eq!(found.lock_id, None);
    }

    #[tokio::test]
    async fn test_set_reference_export_pins_version() {
        let catalog = MemoryCatalog::new();
        let id = catalog
            .add_reference(Reference {
                id: 0,
                namespace: "chair_1".into(),
                count: 1,
                work_env_id: 3,
                export_id: 10,
                export_version_id: None,
                auto_update: 0,
            })
            .await;
        catalog.set_reference_export(id, 11, 42).await.unwrap();
        let reference = catalog.reference(id).await.unwrap();
        assert_eq!(reference.export_id, 11);
        assert_eq!(reference.export_version_id, Some(42));

        let result = catalog.set_reference_export(99, 11, 42).await;
        assert!(matches!(result, Err(Error::NotFound { kind: "reference", .. })));
    }
}
