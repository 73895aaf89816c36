// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations behind the bridge's dispatch table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::copy::{CopyJob, CopyPool};
use crate::catalog::{
    Export, InstanceKind, NewExport, NewExportVersion, NewStage, NewVariant, NewVersion,
    NewWorkEnv, next_version_name,
};
use crate::error::{Error, Result};
use crate::hooks::{HookArgs, HookEvent};
use crate::services::{Services, WorkEnvContext};
use crate::tags;

/// Directory holding the exports of a variant.
pub const EXPORTS_DIR: &str = "_EXPORTS";

/// Directories created in every new variant.
const VARIANT_DIRS: [&str; 3] = [EXPORTS_DIR, "_SANDBOX", "_VIDEOS"];

/// Stage holding an asset's camera scenes.
pub const CAMERA_STAGE: &str = "camera";

/// Stage holding an asset's lighting and render scenes.
pub const RENDERING_STAGE: &str = "rendering";

/// Non-empty, only `[A-Za-z0-9._]`, not all digits.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
        && !name.chars().all(|c| c.is_ascii_digit())
}

/// Export event, comment tags, `after_export` hooks and team refresh of a
/// published export version whose files are in place.
async fn publish_export(
    s: Services,
    export_version_id: i64,
    comment: String,
    string: String,
    version_dir: PathBuf,
    stage_name: String,
) {
    if let Err(e) = s.events.add_export_event(export_version_id).await {
        warn!(export_version_id, error = %e, "Failed to add export event");
    }
    if let Err(e) =
        tags::analyse_comment(&s.events, &comment, InstanceKind::ExportVersion, export_version_id)
            .await
    {
        warn!(export_version_id, error = %e, "Failed to analyse export comment");
    }
    s.hooks
        .trigger(
            HookEvent::AfterExport,
            HookArgs::after_export(s.hooks.gui(), &string, &version_dir, &stage_name),
        )
        .await;
    s.refresh_team().await;
}

/// The bridge's operation layer.
#[derive(Clone)]
pub struct BridgeOps {
    services: Services,
    copies: Arc<CopyPool>,
}

impl BridgeOps {
    /// Operations over `services`, deferring large copies to `copies`.
    pub fn new(services: Services, copies: Arc<CopyPool>) -> Self {
        Self { services, copies }
    }

    /// Shared services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Register the next version of a work environment.
    ///
    /// Returns the scene path the DCC must save to. The path never exists
    /// yet: taken numbers are skipped.
    pub async fn add_version(&self, work_env_id: i64, comment: &str) -> Result<PathBuf> {
        let s = &self.services;
        let ctx = s.work_env_context(work_env_id).await?;
        let project = s.project_path()?;
        let dir = ctx.work_env_dir(&project);
        tokio::fs::create_dir_all(&dir).await?;

        let last = s.catalog.last_version(work_env_id).await?;
        let mut name = next_version_name(last.as_ref().map(|v| v.name.as_str()));
        let mut file_path = dir.join(ctx.version_file_name(&name));
        while tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
            name = next_version_name(Some(&name));
            file_path = dir.join(ctx.version_file_name(&name));
        }

        let screenshots = dir.join("screenshots");
        tokio::fs::create_dir_all(&screenshots).await?;
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let screenshot_path = screenshots.join(format!("{stem}.jpg"));
        let thumbnail_path = screenshots.join(format!("{stem}.thumbnail.jpg"));

        let string = format!("{}/{}", ctx.work_env.string, name);
        let version_id = s
            .catalog
            .insert_version(NewVersion {
                name: name.clone(),
                work_env_id,
                comment: comment.to_string(),
                file_path: path_string(&file_path),
                screenshot_path: path_string(&screenshot_path),
                thumbnail_path: path_string(&thumbnail_path),
                string: string.clone(),
                creation_user: s.user()?,
            })
            .await?;
        info!(version_id, work_env_id, version = %name, "Version added");

        if let Err(e) =
            tags::analyse_comment(&s.events, comment, InstanceKind::WorkVersion, version_id).await
        {
            warn!(version_id, error = %e, "Failed to analyse version comment");
        }
        s.hooks
            .trigger(
                HookEvent::AfterWorkVersionCreation,
                HookArgs::after_work_version_creation(
                    s.hooks.gui(),
                    &string,
                    &name,
                    &path_string(&file_path),
                ),
            )
            .await;
        s.refresh_team().await;
        Ok(file_path)
    }

    /// Export directory of a variant in the project.
    fn export_dir(&self, ctx: &WorkEnvContext, export_name: &str) -> Result<PathBuf> {
        Ok(ctx
            .variant_dir(&self.services.project_path()?)
            .join(EXPORTS_DIR)
            .join(export_name))
    }

    /// Find the export of the work env's variant, creating it if needed.
    pub async fn get_or_add_export(&self, ctx: &WorkEnvContext, export_name: &str) -> Result<Export> {
        if !is_safe_name(export_name) {
            return Err(Error::InvalidRequest(format!(
                "unsafe export name: {export_name:?}"
            )));
        }
        let catalog = &self.services.catalog;
        if let Some(export) = catalog.export_by_name(ctx.variant.id, export_name).await? {
            return Ok(export);
        }

        tokio::fs::create_dir_all(self.export_dir(ctx, export_name)?).await?;
        let id = catalog
            .insert_export(NewExport {
                name: export_name.to_string(),
                variant_id: ctx.variant.id,
                string: format!("{}/{}", ctx.variant.string, export_name),
                creation_user: self.services.user()?,
            })
            .await?;
        info!(export_id = id, export = export_name, "Export added");
        catalog
            .export(id)
            .await?
            .ok_or_else(|| Error::not_found("export", id))
    }

    /// Create a unique staging directory for an export.
    ///
    /// Staging lives under the local path, mirroring the project layout;
    /// without a usable local path the OS temp dir is used.
    pub async fn request_export(
        &self,
        work_env_id: i64,
        export_name: &str,
        multiple: Option<&str>,
        only_dir: bool,
    ) -> Result<PathBuf> {
        let ctx = self.services.work_env_context(work_env_id).await?;
        self.get_or_add_export(&ctx, export_name).await?;

        let root = match &self.services.local_path {
            Some(local) => {
                let root = ctx.variant_dir(local).join(EXPORTS_DIR).join(export_name).join("temp");
                match tokio::fs::create_dir_all(&root).await {
                    Ok(()) => root,
                    Err(e) => {
                        let fallback = std::env::temp_dir();
                        warn!(path = %root.display(), fallback = %fallback.display(), error = %e,
                            "Cannot create local staging dir, exporting in the temp dir");
                        fallback
                    }
                }
            }
            None => {
                let fallback = std::env::temp_dir();
                warn!(fallback = %fallback.display(), "Local path not set, exporting in the temp dir");
                fallback
            }
        };

        let staging = tempfile::Builder::new()
            .prefix("export_")
            .tempdir_in(&root)?
            .keep();
        info!(dir = %staging.display(), "Temporary export directory created");

        if only_dir {
            Ok(staging)
        } else {
            Ok(staging.join(ctx.export_file_name(export_name, multiple)))
        }
    }

    /// Publish staged files as the next version of an export.
    ///
    /// Returns the export-version id. Large file sets are copied in the
    /// background after the row is written; the export event, comment tags,
    /// `after_export` hooks and team refresh then wait for the copy.
    pub async fn add_export_version(
        &self,
        export_name: &str,
        files: &[PathBuf],
        work_env_id: i64,
        version_id: Option<i64>,
        comment: &str,
    ) -> Result<i64> {
        let s = &self.services;
        for file in files {
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                return Err(Error::InvalidRequest(format!(
                    "export file does not exist: {}",
                    file.display()
                )));
            }
        }

        let ctx = s.work_env_context(work_env_id).await?;
        let export = self.get_or_add_export(&ctx, export_name).await?;
        let export_dir = self.export_dir(&ctx, export_name)?;

        let last = s.catalog.last_export_version(export.id).await?;
        let mut name = next_version_name(last.as_ref().map(|v| v.name.as_str()));
        while tokio::fs::try_exists(export_dir.join(&name)).await.unwrap_or(false) {
            name = next_version_name(Some(&name));
        }
        let version_dir = export_dir.join(&name);
        tokio::fs::create_dir_all(&version_dir).await?;

        let work_version = match version_id {
            Some(id) => s.catalog.version(id).await?,
            None => s.catalog.last_version(work_env_id).await?,
        };

        let job = CopyJob::plan(files, &version_dir);
        let deferred = job.should_defer().await;
        let row_files = if deferred {
            job.destinations()
        } else {
            let copied = job.run().await;
            if copied.is_empty() && !files.is_empty() {
                if let Err(e) = tokio::fs::remove_dir(&version_dir).await {
                    warn!(dir = %version_dir.display(), error = %e, "Failed to remove empty version dir");
                }
                return Err(Error::Other("no export file could be copied".into()));
            }
            copied
        };

        let string = format!("{}/{}", export.string, name);
        let export_version_id = s
            .catalog
            .insert_export_version(NewExportVersion {
                name: name.clone(),
                export_id: export.id,
                variant_id: ctx.variant.id,
                work_version_id: work_version.as_ref().map(|v| v.id),
                work_version_thumbnail_path: work_version.and_then(|v| v.thumbnail_path),
                software: Some(ctx.software.name.clone()),
                comment: comment.to_string(),
                files: row_files.iter().map(|f| path_string(f)).collect(),
                string: string.clone(),
                creation_user: s.user()?,
            })
            .await?;
        info!(export_version_id, export = export_name, version = %name, deferred, "Export version added");

        let publish = publish_export(
            s.clone(),
            export_version_id,
            comment.to_string(),
            string,
            version_dir,
            ctx.stage.name.clone(),
        );
        if deferred {
            if let Err((job, publish)) = self.copies.submit_then(job, Box::pin(publish)) {
                warn!(export_version_id, "Copy pool stopped, copying inline");
                job.run().await;
                publish.await;
            }
        } else {
            publish.await;
        }
        Ok(export_version_id)
    }

    /// Scene file of a version.
    pub async fn get_file(&self, version_id: i64) -> Result<String> {
        self.services
            .catalog
            .version(version_id)
            .await?
            .map(|v| v.file_path)
            .ok_or_else(|| Error::not_found("version", version_id))
    }

    /// Export extension of a work environment.
    pub async fn get_export_format(&self, work_env_id: i64) -> Result<String> {
        let ctx = self.services.work_env_context(work_env_id).await?;
        Ok(ctx.export_extension().to_string())
    }

    /// `[preroll, inframe, outframe, postroll]` of the work env's asset.
    pub async fn get_frame_range(&self, work_env_id: i64) -> Result<[i64; 4]> {
        let asset = self.services.work_env_context(work_env_id).await?.asset;
        Ok([asset.preroll, asset.inframe, asset.outframe, asset.postroll])
    }

    /// Project image format.
    pub async fn get_image_format(&self) -> Result<Value> {
        Ok(self.services.catalog.project_settings().await?.image_format)
    }

    /// Project frame rate.
    pub async fn get_frame_rate(&self) -> Result<Option<f64>> {
        Ok(self.services.catalog.project_settings().await?.frame_rate)
    }

    /// Variant `string` of a work environment.
    pub async fn get_string_variant(&self, work_env_id: i64) -> Result<String> {
        Ok(self.services.work_env_context(work_env_id).await?.variant.string)
    }

    /// References of a work environment grouped by referenced stage name.
    pub async fn get_references(&self, work_env_id: i64) -> Result<Value> {
        Ok(json!(self.services.references_by_stage(work_env_id).await?))
    }

    /// Point the references in `namespaces` at the sibling export named
    /// `lod`, pinned to its default version.
    ///
    /// References whose variant has no such export, or whose LOD export has
    /// no default version, are left alone. Returns how many were switched.
    pub async fn modify_reference_lod(
        &self,
        work_env_id: i64,
        lod: &str,
        namespaces: &[String],
    ) -> Result<usize> {
        let catalog = &self.services.catalog;
        let mut switched = 0;
        for reference in catalog.references(work_env_id).await? {
            if !namespaces.contains(&reference.namespace) {
                continue;
            }
            let Some(current) = catalog.export(reference.export_id).await? else {
                warn!(reference_id = reference.id, "Reference points at a missing export");
                continue;
            };
            let target = catalog
                .variant_exports(current.variant_id)
                .await?
                .into_iter()
                .find(|e| e.name == lod);
            let Some((export, version_id)) =
                target.and_then(|e| e.default_export_version.map(|v| (e, v)))
            else {
                continue;
            };
            catalog
                .set_reference_export(reference.id, export.id, version_id)
                .await?;
            info!(
                reference_id = reference.id,
                namespace = %reference.namespace,
                lod,
                "Reference switched"
            );
            switched += 1;
        }
        self.services.refresh_team().await;
        Ok(switched)
    }

    /// Name of the export behind the reference with `namespace`.
    pub async fn get_export_name_from_reference_namespace(
        &self,
        namespace: &str,
        work_env_id: i64,
    ) -> Result<String> {
        let catalog = &self.services.catalog;
        let reference = catalog
            .references(work_env_id)
            .await?
            .into_iter()
            .find(|r| r.namespace == namespace)
            .ok_or_else(|| Error::not_found("reference", namespace))?;
        catalog
            .export(reference.export_id)
            .await?
            .map(|e| e.name)
            .ok_or_else(|| Error::not_found("export", reference.export_id))
    }

    /// Work environment of the same software in the asset's camera stage.
    pub async fn create_or_get_camera_work_env(&self, work_env_id: i64) -> Result<i64> {
        self.create_or_get_stage_work_env(work_env_id, CAMERA_STAGE).await
    }

    /// Work environment of the same software in the asset's rendering stage.
    pub async fn create_or_get_rendering_work_env(&self, work_env_id: i64) -> Result<i64> {
        self.create_or_get_stage_work_env(work_env_id, RENDERING_STAGE).await
    }

    /// Find the work env named after `work_env_id`'s software in the default
    /// variant of the sibling stage `stage_name`. The stage, its `main`
    /// variant and the work env are created on first use; a new work env
    /// gets a first version.
    async fn create_or_get_stage_work_env(&self, work_env_id: i64, stage_name: &str) -> Result<i64> {
        let s = &self.services;
        let ctx = s.work_env_context(work_env_id).await?;
        let software_name = ctx.work_env.name.clone();

        let stage = match s.catalog.stage_by_name(ctx.asset.id, stage_name).await? {
            Some(stage) => stage,
            None => {
                let id = self.create_stage(&ctx.asset.string, ctx.asset.id, stage_name).await?;
                s.catalog
                    .stage(id)
                    .await?
                    .ok_or_else(|| Error::not_found("stage", id))?
            }
        };
        let variant = match stage.default_variant_id {
            Some(id) => s.catalog.variant(id).await?,
            None => None,
        };
        let variant = match variant {
            Some(variant) => variant,
            None => {
                let id = self
                    .create_variant("main", "default variant", &stage.string, stage.id)
                    .await?;
                s.catalog.set_stage_default_variant(stage.id, id).await?;
                s.catalog
                    .variant(id)
                    .await?
                    .ok_or_else(|| Error::not_found("variant", id))?
            }
        };

        if let Some(existing) = s.catalog.work_env_by_name(variant.id, &software_name).await? {
            return Ok(existing.id);
        }
        let software = s
            .catalog
            .software_by_name(&software_name)
            .await?
            .ok_or_else(|| Error::not_found("software", &software_name))?;
        let string = format!("{}/{}", variant.string, software_name);
        tokio::fs::create_dir_all(s.project_path()?.join(&string).join("screenshots")).await?;
        let id = s
            .catalog
            .insert_work_env(NewWorkEnv {
                name: software_name.clone(),
                variant_id: variant.id,
                software_id: software.id,
                export_extension: None,
                string: string.clone(),
                creation_user: s.user()?,
            })
            .await?;
        info!(work_env_id = id, stage = stage_name, "Work environment added");
        self.after_creation(
            InstanceKind::WorkEnv,
            id,
            HookEvent::AfterWorkEnvironmentCreation,
            &string,
            &software_name,
        )
        .await;
        self.add_version(id, "").await?;
        Ok(id)
    }

    async fn create_stage(&self, asset_string: &str, asset_id: i64, name: &str) -> Result<i64> {
        let s = &self.services;
        let string = format!("{asset_string}/{name}");
        tokio::fs::create_dir_all(s.project_path()?.join(&string)).await?;
        let id = s
            .catalog
            .insert_stage(NewStage {
                name: name.to_string(),
                asset_id,
                string: string.clone(),
                creation_user: s.user()?,
            })
            .await?;
        info!(stage_id = id, stage = name, "Stage added");
        self.after_creation(InstanceKind::Stage, id, HookEvent::AfterStageCreation, &string, name)
            .await;
        Ok(id)
    }

    async fn create_variant(
        &self,
        name: &str,
        comment: &str,
        stage_string: &str,
        stage_id: i64,
    ) -> Result<i64> {
        let s = &self.services;
        let string = format!("{stage_string}/{name}");
        let dir = s.project_path()?.join(&string);
        for sub in VARIANT_DIRS {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        let id = s
            .catalog
            .insert_variant(NewVariant {
                name: name.to_string(),
                stage_id,
                comment: comment.to_string(),
                string: string.clone(),
                creation_user: s.user()?,
            })
            .await?;
        info!(variant_id = id, variant = name, "Variant added");
        self.after_creation(InstanceKind::Variant, id, HookEvent::AfterVariantCreation, &string, name)
            .await;
        Ok(id)
    }

    /// Creation event and `after_*_creation` hooks of a new instance.
    async fn after_creation(
        &self,
        kind: InstanceKind,
        id: i64,
        event: HookEvent,
        string: &str,
        name: &str,
    ) {
        let s = &self.services;
        if let Err(e) = s.events.add_creation_event(kind, id).await {
            warn!(id, kind = kind.as_str(), error = %e, "Failed to add creation event");
        }
        s.hooks
            .trigger(event, HookArgs::after_creation(s.hooks.gui(), string, name))
            .await;
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
