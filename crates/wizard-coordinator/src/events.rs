// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project event log.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;

use crate::catalog::{Catalog, InstanceKind, NewEvent};
use crate::env::Environment;
use crate::error::{Error, Result};

/// Writes rows to the `events` table on behalf of the current user.
#[derive(Clone)]
pub struct Events {
    catalog: Arc<dyn Catalog>,
    env: Arc<Environment>,
}

impl Events {
    /// Event writer over `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>, env: Arc<Environment>) -> Self {
        Self { catalog, env }
    }

    /// Catalog written to.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Insert one event; the author is the environment user.
    pub async fn add_event(
        &self,
        kind: &str,
        title: &str,
        message: &str,
        data: Value,
        additional_message: Option<String>,
        image_path: Option<String>,
    ) -> Result<i64> {
        let creation_user = self
            .env
            .user()
            .ok_or_else(|| Error::Other("no user in environment".into()))?;
        let id = self
            .catalog
            .insert_event(NewEvent {
                kind: kind.to_string(),
                title: title.to_string(),
                message: message.to_string(),
                data,
                additional_message,
                image_path,
                creation_user,
            })
            .await?;
        info!(event_id = id, kind, title, "Event added");
        Ok(id)
    }

    /// `string` of an instance, e.g. `assets/characters/hero`.
    pub async fn instance_to_string(&self, kind: InstanceKind, id: i64) -> Result<String> {
        self.catalog
            .instance_string(kind, id)
            .await?
            .ok_or_else(|| Error::not_found(kind.as_str(), id))
    }

    /// "Created ..." event for any instance.
    pub async fn add_creation_event(&self, kind: InstanceKind, id: i64) -> Result<i64> {
        let title = format!("Created {}", self.instance_to_string(kind, id).await?);
        self.add_event("creation", &title, "", json!([kind.as_str(), id]), None, None)
            .await
    }

    /// "Exported ..." event carrying the export comment and thumbnail.
    pub async fn add_export_event(&self, export_version_id: i64) -> Result<i64> {
        let version = self
            .catalog
            .export_version(export_version_id)
            .await?
            .ok_or_else(|| Error::not_found("export_version", export_version_id))?;
        let title = format!("Exported {}", version.string);
        self.add_event(
            "export",
            &title,
            version.comment.as_deref().unwrap_or_default(),
            json!(export_version_id),
            Some(String::new()),
            version.work_version_thumbnail_path,
        )
        .await
    }

    /// Video playblast event.
    pub async fn add_video_event(
        &self,
        video_id: i64,
        variant_id: i64,
        comment: &str,
        thumbnail_path: Option<String>,
    ) -> Result<i64> {
        let title = format!(
            "Created a video from {}",
            self.instance_to_string(InstanceKind::Variant, variant_id)
                .await?
        );
        self.add_event(
            "video",
            &title,
            comment,
            json!(video_id),
            Some(String::new()),
            thumbnail_path,
        )
        .await
    }

    /// Archive event.
    pub async fn add_archive_event(&self, title: &str, archive_path: &str) -> Result<i64> {
        self.add_event("archive", title, "", json!(archive_path), None, None)
            .await
    }

    /// Tag event addressed to `user` (or `all`).
    pub async fn add_tag_event(
        &self,
        kind: InstanceKind,
        id: i64,
        comment: &str,
        user: &str,
    ) -> Result<i64> {
        let data = json!({
            "instance": [kind.as_str(), id],
            "tagged_user": user,
        });
        let title = format!("Tagged {user} in a comment");
        self.add_event("tag", &title, comment, data, None, None).await
    }

    /// Replace the message of an existing event.
    pub async fn modify_comment(&self, event_id: i64, comment: &str) -> Result<()> {
        self.catalog.set_event_message(event_id, comment).await
    }
}
