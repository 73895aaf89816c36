// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog trait and row types.
//!
//! The catalog is the slice of the repository and project databases the
//! fabric reads and writes. Rows deserialize straight from the proxy's
//! `as_dict` replies; extra columns are ignored.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Repository user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Row id.
    pub id: i64,
    /// Login name, used for `@name` tags.
    pub user_name: String,
}

/// Project-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Frames per second.
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Image format, usually `[width, height]`.
    #[serde(default)]
    pub image_format: Value,
    /// Ids of the users who are members of the project.
    #[serde(default)]
    pub users_ids: Vec<i64>,
}

/// Asset category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Row id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Parent domain.
    pub domain_id: i64,
    /// Path-like identifier.
    pub string: String,
}

/// Asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Row id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Parent category.
    pub category_id: i64,
    /// First frame.
    #[serde(default)]
    pub inframe: i64,
    /// Last frame.
    #[serde(default)]
    pub outframe: i64,
    /// Frames before `inframe`.
    #[serde(default)]
    pub preroll: i64,
    /// Frames after `outframe`.
    #[serde(default)]
    pub postroll: i64,
    /// Path-like identifier.
    pub string: String,
}

/// Pipeline stage of an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Row id.
    pub id: i64,
    /// Name (`modeling`, `rigging`, ...).
    pub name: String,
    /// Parent asset.
    pub asset_id: i64,
    /// Path-like identifier.
    pub string: String,
    /// Variant opened by default.
    #[serde(default)]
    pub default_variant_id: Option<i64>,
}

/// Variant of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Row id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Parent stage.
    pub stage_id: i64,
    /// Path-like identifier.
    pub string: String,
}

/// Work environment: one software inside a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEnv {
    /// Row id.
    pub id: i64,
    /// Name (the software name).
    pub name: String,
    /// Parent variant.
    pub variant_id: i64,
    /// Software used.
    pub software_id: i64,
    /// User holding the lock.
    #[serde(default)]
    pub lock_id: Option<i64>,
    /// Export extension overriding the software default.
    #[serde(default)]
    pub export_extension: Option<String>,
    /// Accumulated seconds spent in the software.
    #[serde(default)]
    pub work_time: f64,
    /// Path-like identifier.
    pub string: String,
}

/// Saved version of a work environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Row id.
    pub id: i64,
    /// Zero-padded number (`0001`).
    pub name: String,
    /// Parent work environment.
    pub work_env_id: i64,
    /// Comment left by the author.
    #[serde(default)]
    pub comment: Option<String>,
    /// Scene file.
    pub file_path: String,
    /// Screenshot file.
    #[serde(default)]
    pub screenshot_path: Option<String>,
    /// Thumbnail file.
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    /// Path-like identifier.
    pub string: String,
    /// Author.
    #[serde(default)]
    pub creation_user: Option<String>,
}

/// Software definition with its launch templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Software {
    /// Row id.
    pub id: i64,
    /// Name (`maya`, `houdini`, ...).
    pub name: String,
    /// Scene file extension.
    pub extension: String,
    /// Interactive executable.
    #[serde(default)]
    pub path: Option<String>,
    /// Batch executable.
    #[serde(default)]
    pub batch_path: Option<String>,
    /// Extra script dirs: JSON list or newline-separated.
    #[serde(default)]
    pub additionnal_scripts: Option<String>,
    /// Extra environment: JSON object.
    #[serde(default)]
    pub additionnal_env: Option<String>,
    /// Template used when the scene file exists.
    #[serde(default)]
    pub file_command: Option<String>,
    /// Template used when it does not.
    #[serde(default)]
    pub no_file_command: Option<String>,
    /// Batch template with a scene file.
    #[serde(default)]
    pub batch_file_command: Option<String>,
    /// Batch template without a scene file.
    #[serde(default)]
    pub batch_no_file_command: Option<String>,
}

/// Named export of a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    /// Row id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Parent variant.
    pub variant_id: i64,
    /// Path-like identifier.
    pub string: String,
    /// Version picked by references by default.
    #[serde(default)]
    pub default_export_version: Option<i64>,
}

/// Published version of an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportVersion {
    /// Row id.
    pub id: i64,
    /// Zero-padded number.
    pub name: String,
    /// Parent export.
    pub export_id: i64,
    /// Variant the export belongs to.
    pub variant_id: i64,
    /// Work version it was exported from.
    #[serde(default)]
    pub work_version_id: Option<i64>,
    /// Thumbnail of that work version.
    #[serde(default)]
    pub work_version_thumbnail_path: Option<String>,
    /// Software name.
    #[serde(default)]
    pub software: Option<String>,
    /// Comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// Exported files as JSON text.
    pub files: String,
    /// Path-like identifier.
    pub string: String,
    /// Author.
    #[serde(default)]
    pub creation_user: Option<String>,
}

impl ExportVersion {
    /// Decoded file list.
    pub fn files_list(&self) -> Vec<String> {
        serde_json::from_str(&self.files).unwrap_or_default()
    }
}

/// A work environment referencing an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// Row id.
    pub id: i64,
    /// Namespace in the scene.
    pub namespace: String,
    /// Instance count.
    #[serde(default)]
    pub count: i64,
    /// Referencing work environment.
    pub work_env_id: i64,
    /// Referenced export.
    pub export_id: i64,
    /// Pinned export version.
    #[serde(default)]
    pub export_version_id: Option<i64>,
    /// Follow the export's default version.
    #[serde(default)]
    pub auto_update: i64,
}

/// New `versions` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    /// Zero-padded number.
    pub name: String,
    /// Parent work environment.
    pub work_env_id: i64,
    /// Comment.
    pub comment: String,
    /// Scene file.
    pub file_path: String,
    /// Screenshot file.
    pub screenshot_path: String,
    /// Thumbnail file.
    pub thumbnail_path: String,
    /// Path-like identifier.
    pub string: String,
    /// Author.
    pub creation_user: String,
}

/// New `exports` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExport {
    /// Name.
    pub name: String,
    /// Parent variant.
    pub variant_id: i64,
    /// Path-like identifier.
    pub string: String,
    /// Author.
    pub creation_user: String,
}

/// New `export_versions` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExportVersion {
    /// Zero-padded number.
    pub name: String,
    /// Parent export.
    pub export_id: i64,
    /// Variant.
    pub variant_id: i64,
    /// Source work version.
    pub work_version_id: Option<i64>,
    /// Its thumbnail.
    pub work_version_thumbnail_path: Option<String>,
    /// Software name.
    pub software: Option<String>,
    /// Comment.
    pub comment: String,
    /// Exported files.
    pub files: Vec<String>,
    /// Path-like identifier.
    pub string: String,
    /// Author.
    pub creation_user: String,
}

/// New `stages` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStage {
    /// Stage name.
    pub name: String,
    /// Parent asset.
    pub asset_id: i64,
    /// Path-like identifier.
    pub string: String,
    /// Creating user.
    pub creation_user: String,
}

/// New `variants` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVariant {
    /// Variant name.
    pub name: String,
    /// Parent stage.
    pub stage_id: i64,
    /// Free-form comment.
    pub comment: String,
    /// Path-like identifier.
    pub string: String,
    /// Creating user.
    pub creation_user: String,
}

/// New `work_envs` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkEnv {
    /// Work environment name (the software name).
    pub name: String,
    /// Parent variant.
    pub variant_id: i64,
    /// Software used.
    pub software_id: i64,
    /// Export extension overriding the software default.
    pub export_extension: Option<String>,
    /// Path-like identifier.
    pub string: String,
    /// Creating user.
    pub creation_user: String,
}

/// New `events` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event type (`creation`, `export`, `tag`, ...).
    pub kind: String,
    /// Title.
    pub title: String,
    /// Body.
    pub message: String,
    /// Payload, stored as JSON text.
    pub data: Value,
    /// Secondary text.
    pub additional_message: Option<String>,
    /// Image shown with the event.
    pub image_path: Option<String>,
    /// Author.
    pub creation_user: String,
}

/// Kinds of catalog instance that carry a `string` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// `domains`
    Domain,
    /// `categories`
    Category,
    /// `assets`
    Asset,
    /// `stages`
    Stage,
    /// `variants`
    Variant,
    /// `work_envs`
    WorkEnv,
    /// `versions`
    WorkVersion,
    /// `exports`
    Export,
    /// `export_versions`
    ExportVersion,
}

impl InstanceKind {
    /// Table holding this kind.
    pub fn table(self) -> &'static str {
        match self {
            Self::Domain => "domains",
            Self::Category => "categories",
            Self::Asset => "assets",
            Self::Stage => "stages",
            Self::Variant => "variants",
            Self::WorkEnv => "work_envs",
            Self::WorkVersion => "versions",
            Self::Export => "exports",
            Self::ExportVersion => "export_versions",
        }
    }

    /// Wire name (`work_version`, `export_version`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Category => "category",
            Self::Asset => "asset",
            Self::Stage => "stage",
            Self::Variant => "variant",
            Self::WorkEnv => "work_env",
            Self::WorkVersion => "work_version",
            Self::Export => "export",
            Self::ExportVersion => "export_version",
        }
    }
}

/// Reads and writes of the repository and project databases.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Id of a repository user.
    async fn user_id(&self, user_name: &str) -> Result<Option<i64>>;

    /// Name of a repository user.
    async fn user_name(&self, user_id: i64) -> Result<Option<String>>;

    /// Every repository user.
    async fn users(&self) -> Result<Vec<User>>;

    /// Root directory of a project.
    async fn project_path(&self, project_name: &str) -> Result<Option<PathBuf>>;

    /// Settings of the current project.
    async fn project_settings(&self) -> Result<ProjectSettings>;

    /// Look up a category.
    async fn category(&self, id: i64) -> Result<Option<Category>>;

    /// Look up an asset.
    async fn asset(&self, id: i64) -> Result<Option<Asset>>;

    /// Look up a stage.
    async fn stage(&self, id: i64) -> Result<Option<Stage>>;

    /// Look up a variant.
    async fn variant(&self, id: i64) -> Result<Option<Variant>>;

    /// Look up a work environment.
    async fn work_env(&self, id: i64) -> Result<Option<WorkEnv>>;

    /// Look up a version.
    async fn version(&self, id: i64) -> Result<Option<Version>>;

    /// Highest version of a work environment.
    async fn last_version(&self, work_env_id: i64) -> Result<Option<Version>>;

    /// Look up a software.
    async fn software(&self, id: i64) -> Result<Option<Software>>;

    /// Look up an export.
    async fn export(&self, id: i64) -> Result<Option<Export>>;

    /// Export of a variant by name.
    async fn export_by_name(&self, variant_id: i64, name: &str) -> Result<Option<Export>>;

    /// Look up an export version.
    async fn export_version(&self, id: i64) -> Result<Option<ExportVersion>>;

    /// Highest version of an export.
    async fn last_export_version(&self, export_id: i64) -> Result<Option<ExportVersion>>;

    /// Insert a version, returning its id.
    async fn insert_version(&self, version: NewVersion) -> Result<i64>;

    /// Insert an export, returning its id.
    async fn insert_export(&self, export: NewExport) -> Result<i64>;

    /// Insert an export version, returning its id.
    async fn insert_export_version(&self, version: NewExportVersion) -> Result<i64>;

    /// Set or clear the lock of a work environment.
    async fn set_work_env_lock(&self, work_env_id: i64, user_id: Option<i64>) -> Result<()>;

    /// Add seconds to the work time of a work environment.
    async fn add_work_time(&self, work_env_id: i64, seconds: f64) -> Result<()>;

    /// Work environments locked by a user.
    async fn locked_work_envs(&self, user_id: i64) -> Result<Vec<i64>>;

    /// Insert an event, returning its id.
    async fn insert_event(&self, event: NewEvent) -> Result<i64>;

    /// `string` column of an instance.
    async fn instance_string(&self, kind: InstanceKind, id: i64) -> Result<Option<String>>;

    /// Replace the message of an event.
    async fn set_event_message(&self, event_id: i64, message: &str) -> Result<()>;

    /// References held by a work environment.
    async fn references(&self, work_env_id: i64) -> Result<Vec<Reference>>;

    /// Point a reference at another export and export version.
    async fn set_reference_export(
        &self,
        reference_id: i64,
        export_id: i64,
        export_version_id: i64,
    ) -> Result<()>;

    /// Exports of a variant, oldest first.
    async fn variant_exports(&self, variant_id: i64) -> Result<Vec<Export>>;

    /// Stage of an asset by name.
    async fn stage_by_name(&self, asset_id: i64, name: &str) -> Result<Option<Stage>>;

    /// Work environment of a variant by name.
    async fn work_env_by_name(&self, variant_id: i64, name: &str) -> Result<Option<WorkEnv>>;

    /// Software by name.
    async fn software_by_name(&self, name: &str) -> Result<Option<Software>>;

    /// Insert a stage, returning its id.
    async fn insert_stage(&self, stage: NewStage) -> Result<i64>;

    /// Insert a variant, returning its id.
    async fn insert_variant(&self, variant: NewVariant) -> Result<i64>;

    /// Set the default variant of a stage.
    async fn set_stage_default_variant(&self, stage_id: i64, variant_id: i64) -> Result<()>;

    /// Insert a work environment, returning its id.
    async fn insert_work_env(&self, work_env: NewWorkEnv) -> Result<i64>;
}
