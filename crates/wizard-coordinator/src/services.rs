// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State shared by the bridge and the launcher.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{Asset, Catalog, Category, Software, Stage, Variant, WorkEnv};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::events::Events;
use crate::hooks::HookDispatcher;
use crate::team;

/// Handles every request-serving component needs.
#[derive(Clone)]
pub struct Services {
    /// Session state.
    pub env: Arc<Environment>,
    /// Repository and project databases.
    pub catalog: Arc<dyn Catalog>,
    /// Event writer.
    pub events: Events,
    /// Hook dispatcher.
    pub hooks: Arc<HookDispatcher>,
    /// User's local cache for export staging.
    pub local_path: Option<PathBuf>,
    /// Per-user wizard folder.
    pub user_folder: PathBuf,
    /// Directory holding `<software>_wizard` plugin folders.
    pub plugins_root: PathBuf,
}

impl Services {
    /// Bundle the shared handles; `hooks` must use the same environment.
    pub fn new(
        env: Arc<Environment>,
        catalog: Arc<dyn Catalog>,
        hooks: Arc<HookDispatcher>,
    ) -> Self {
        let events = Events::new(catalog.clone(), env.clone());
        Self {
            env,
            catalog,
            events,
            hooks,
            local_path: None,
            user_folder: PathBuf::from("."),
            plugins_root: PathBuf::from("softwares"),
        }
    }

    /// Set the local staging root.
    pub fn with_local_path(mut self, path: Option<PathBuf>) -> Self {
        self.local_path = path;
        self
    }

    /// Set the user folder.
    pub fn with_user_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_folder = path.into();
        self
    }

    /// Set the plugins root.
    pub fn with_plugins_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.plugins_root = path.into();
        self
    }

    /// Root of the current project.
    pub fn project_path(&self) -> Result<PathBuf> {
        self.env
            .project_path()
            .ok_or_else(|| Error::Other("no project path in environment".into()))
    }

    /// Project `hooks/` directory.
    pub fn hooks_folder(&self) -> Result<PathBuf> {
        Ok(self.project_path()?.join("hooks"))
    }

    /// Project `plugins/` directory.
    pub fn plugins_folder(&self) -> Result<PathBuf> {
        Ok(self.project_path()?.join("plugins"))
    }

    /// Current user name.
    pub fn user(&self) -> Result<String> {
        self.env
            .user()
            .ok_or_else(|| Error::Other("no user in environment".into()))
    }

    /// Repository id of the current user.
    pub async fn current_user_id(&self) -> Result<i64> {
        let user = self.user()?;
        self.catalog
            .user_id(&user)
            .await?
            .ok_or_else(|| Error::not_found("user", user))
    }

    /// Ask the team server to refresh every client of the project.
    ///
    /// `false` when no team server is configured or it is unreachable.
    pub async fn refresh_team(&self) -> bool {
        let (Some(endpoint), Some(project)) = (self.env.team_dns(), self.env.project_name())
        else {
            debug!("No team server configured, skipping refresh");
            return false;
        };
        team::client::refresh_team(&endpoint, &project).await
    }

    /// Load a work environment with its ancestors and software.
    pub async fn work_env_context(&self, work_env_id: i64) -> Result<WorkEnvContext> {
        let catalog = &self.catalog;
        let work_env = catalog
            .work_env(work_env_id)
            .await?
            .ok_or_else(|| Error::not_found("work_env", work_env_id))?;
        let variant = catalog
            .variant(work_env.variant_id)
            .await?
            .ok_or_else(|| Error::not_found("variant", work_env.variant_id))?;
        let stage = catalog
            .stage(variant.stage_id)
            .await?
            .ok_or_else(|| Error::not_found("stage", variant.stage_id))?;
        let asset = catalog
            .asset(stage.asset_id)
            .await?
            .ok_or_else(|| Error::not_found("asset", stage.asset_id))?;
        let category = catalog
            .category(asset.category_id)
            .await?
            .ok_or_else(|| Error::not_found("category", asset.category_id))?;
        let software = catalog
            .software(work_env.software_id)
            .await?
            .ok_or_else(|| Error::not_found("software", work_env.software_id))?;
        Ok(WorkEnvContext {
            work_env,
            variant,
            stage,
            asset,
            category,
            software,
        })
    }

    /// References of a work environment grouped by referenced stage name.
    ///
    /// A reference follows its pinned export version, else the export's
    /// default version, else the latest one. Dangling references are skipped.
    pub async fn references_by_stage(
        &self,
        work_env_id: i64,
    ) -> Result<BTreeMap<String, Vec<ReferenceFiles>>> {
        let catalog = &self.catalog;
        let mut by_stage: BTreeMap<String, Vec<ReferenceFiles>> = BTreeMap::new();
        for reference in catalog.references(work_env_id).await? {
            let Some(export) = catalog.export(reference.export_id).await? else {
                warn!(reference_id = reference.id, "Reference to a missing export");
                continue;
            };
            let version = match reference.export_version_id.or(export.default_export_version) {
                Some(id) => catalog.export_version(id).await?,
                None => catalog.last_export_version(export.id).await?,
            };
            let Some(version) = version else {
                warn!(reference_id = reference.id, "Referenced export has no version");
                continue;
            };
            let Some(variant) = catalog.variant(export.variant_id).await? else {
                continue;
            };
            let Some(stage) = catalog.stage(variant.stage_id).await? else {
                continue;
            };
            let Some(asset) = catalog.asset(stage.asset_id).await? else {
                continue;
            };
            let category_name = catalog
                .category(asset.category_id)
                .await?
                .map(|c| c.name)
                .unwrap_or_default();

            by_stage.entry(stage.name).or_default().push(ReferenceFiles {
                files: version.files_list(),
                namespace: reference.namespace,
                count: reference.count,
                category_name,
                asset_name: asset.name,
                variant_name: variant.name,
                string_variant: variant.string,
            });
        }
        Ok(by_stage)
    }
}

/// Files a reference points at, as DCC plugins consume them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceFiles {
    /// Files of the resolved export version.
    pub files: Vec<String>,
    /// Namespace in the scene.
    pub namespace: String,
    /// Instance count.
    pub count: i64,
    /// Category of the referenced asset.
    pub category_name: String,
    /// Referenced asset.
    pub asset_name: String,
    /// Referenced variant.
    pub variant_name: String,
    /// `string` of the referenced variant.
    pub string_variant: String,
}

/// A work environment with everything needed to name its files.
#[derive(Debug, Clone)]
pub struct WorkEnvContext {
    /// The work environment.
    pub work_env: WorkEnv,
    /// Its variant.
    pub variant: Variant,
    /// Its stage.
    pub stage: Stage,
    /// Its asset.
    pub asset: Asset,
    /// Its category.
    pub category: Category,
    /// Its software.
    pub software: Software,
}

impl WorkEnvContext {
    /// `<category>_<asset>_<stage>_<variant>`
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.category.name, self.asset.name, self.stage.name, self.variant.name
        )
    }

    /// `<category>_<asset>_<stage>_<variant>.<NNNN>.<ext>`
    pub fn version_file_name(&self, version_name: &str) -> String {
        format!(
            "{}.{}.{}",
            self.file_stem(),
            version_name,
            self.software.extension
        )
    }

    /// Extension of exported files.
    pub fn export_extension(&self) -> &str {
        self.work_env
            .export_extension
            .as_deref()
            .filter(|ext| !ext.is_empty())
            .unwrap_or(&self.software.extension)
    }

    /// `<category>_<asset>_<stage>_<variant>_<export>[.<multiple>].<ext>`
    pub fn export_file_name(&self, export_name: &str, multiple: Option<&str>) -> String {
        let mut name = format!("{}_{}", self.file_stem(), export_name);
        if let Some(multiple) = multiple.filter(|m| !m.is_empty()) {
            name.push('.');
            name.push_str(multiple);
        }
        name.push('.');
        name.push_str(self.export_extension());
        name
    }

    /// Work environment directory under `root`.
    pub fn work_env_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.work_env.string)
    }

    /// Variant directory under `root`.
    pub fn variant_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.variant.string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(export_extension: Option<&str>) -> WorkEnvContext {
        WorkEnvContext {
            work_env: WorkEnv {
                id: 1,
                name: "maya".into(),
                variant_id: 2,
                software_id: 3,
                lock_id: None,
                export_extension: export_extension.map(String::from),
                work_time: 0.0,
                string: "assets/characters/hero/rigging/main/maya".into(),
            },
            variant: Variant {
                id: 2,
                name: "main".into(),
                stage_id: 4,
                string: "assets/characters/hero/rigging/main".into(),
            },
            stage: Stage {
                id: 4,
                name: "rigging".into(),
                asset_id: 5,
                string: "assets/characters/hero/rigging".into(),
                default_variant_id: None,
            },
            asset: Asset {
                id: 5,
                name: "hero".into(),
                category_id: 6,
                inframe: 1001,
                outframe: 1100,
                preroll: 0,
                postroll: 0,
                string: "assets/characters/hero".into(),
            },
            category: Category {
                id: 6,
                name: "characters".into(),
                domain_id: 7,
                string: "assets/characters".into(),
            },
            software: Software {
                id: 3,
                name: "maya".into(),
                extension: "ma".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_version_file_name() {
        assert_eq!(
            context(None).version_file_name("0007"),
            "characters_hero_rigging_main.0007.ma"
        );
    }

    #[test]
    fn test_export_file_name_extension_and_multiple() {
        assert_eq!(
            context(None).export_file_name("rig", None),
            "characters_hero_rigging_main_rig.ma"
        );
        assert_eq!(
            context(Some("abc")).export_file_name("cache", Some("0012")),
            "characters_hero_rigging_main_cache.0012.abc"
        );
        assert_eq!(
            context(Some("")).export_file_name("rig", Some("")),
            "characters_hero_rigging_main_rig.ma"
        );
    }

    #[test]
    fn test_dirs() {
        let ctx = context(None);
        let root = Path::new("/prod/forest");
        assert_eq!(
            ctx.work_env_dir(root),
            PathBuf::from("/prod/forest/assets/characters/hero/rigging/main/maya")
        );
        assert_eq!(
            ctx.variant_dir(root),
            PathBuf::from("/prod/forest/assets/characters/hero/rigging/main")
        );
    }
}
