// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog backed by the database proxy.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use super::traits::*;
use super::now_timestamp;
use crate::error::{Error, Result};
use crate::proxy::DbClient;

const REPOSITORY: &str = "repository";
const PROJECT: &str = "project";

/// [`Catalog`] issuing SQL through a [`DbClient`].
#[derive(Debug, Clone)]
pub struct ProxyCatalog {
    db: DbClient,
}

impl ProxyCatalog {
    /// Catalog using `db`.
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    async fn one<T: DeserializeOwned>(
        &self,
        level: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<T>> {
        match self.db.fetch_one(level, sql, params).await {
            Some(row) => Ok(Some(serde_json::from_value(Value::Object(row))?)),
            None => Ok(None),
        }
    }

    async fn all<T: DeserializeOwned>(
        &self,
        level: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let rows = self
            .db
            .fetch_all(level, sql, params)
            .await
            .ok_or_else(|| Error::CatalogUnavailable(sql.to_string()))?;
        rows.into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Error::from))
            .collect()
    }

    async fn by_id<T: DeserializeOwned>(&self, table: &str, id: i64) -> Result<Option<T>> {
        let sql = format!("SELECT * FROM {table} WHERE id = %s");
        self.one(PROJECT, &sql, &[json!(id)]).await
    }

    async fn insert_returning(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let row = self
            .db
            .fetch_one(PROJECT, sql, params)
            .await
            .ok_or_else(|| Error::CatalogUnavailable(sql.to_string()))?;
        row.get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Other(format!("insert returned no id: {sql}")))
    }

    async fn exec(&self, level: &str, sql: &str, params: &[Value]) -> Result<()> {
        if self.db.execute(level, sql, params).await {
            Ok(())
        } else {
            Err(Error::CatalogUnavailable(sql.to_string()))
        }
    }
}

fn text_json(row: &Map<String, Value>, column: &str) -> Value {
    match row.get(column) {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

#[async_trait]
impl Catalog for ProxyCatalog {
    async fn user_id(&self, user_name: &str) -> Result<Option<i64>> {
        let user: Option<User> = self
            .one(
                REPOSITORY,
                "SELECT id, user_name FROM users WHERE user_name = %s",
                &[json!(user_name)],
            )
            .await?;
        Ok(user.map(|u| u.id))
    }

    async fn user_name(&self, user_id: i64) -> Result<Option<String>> {
        let user: Option<User> = self
            .one(
                REPOSITORY,
                "SELECT id, user_name FROM users WHERE id = %s",
                &[json!(user_id)],
            )
            .await?;
        Ok(user.map(|u| u.user_name))
    }

    async fn users(&self) -> Result<Vec<User>> {
        self.all(REPOSITORY, "SELECT id, user_name FROM users", &[])
            .await
    }

    async fn project_path(&self, project_name: &str) -> Result<Option<PathBuf>> {
        let row = self
            .db
            .fetch_one(
                REPOSITORY,
                "SELECT project_path FROM projects WHERE project_name = %s",
                &[json!(project_name)],
            )
            .await;
        Ok(row
            .and_then(|row| row.get("project_path").and_then(Value::as_str).map(PathBuf::from)))
    }

    async fn project_settings(&self) -> Result<ProjectSettings> {
        let Some(row) = self
            .db
            .fetch_one(PROJECT, "SELECT * FROM settings WHERE id = 1", &[])
            .await
        else {
            return Ok(ProjectSettings::default());
        };
        Ok(ProjectSettings {
            frame_rate: row.get("frame_rate").and_then(Value::as_f64),
            image_format: text_json(&row, "image_format"),
            users_ids: serde_json::from_value(text_json(&row, "users_ids")).unwrap_or_default(),
        })
    }

    async fn category(&self, id: i64) -> Result<Option<Category>> {
        self.by_id("categories", id).await
    }

    async fn asset(&self, id: i64) -> Result<Option<Asset>> {
        self.by_id("assets", id).await
    }

    async fn stage(&self, id: i64) -> Result<Option<Stage>> {
        self.by_id("stages", id).await
    }

    async fn variant(&self, id: i64) -> Result<Option<Variant>> {
        self.by_id("variants", id).await
    }

    async fn work_env(&self, id: i64) -> Result<Option<WorkEnv>> {
        self.by_id("work_envs", id).await
    }

    async fn version(&self, id: i64) -> Result<Option<Version>> {
        self.by_id("versions", id).await
    }

    async fn last_version(&self, work_env_id: i64) -> Result<Option<Version>> {
        self.one(
            PROJECT,
            "SELECT * FROM versions WHERE work_env_id = %s ORDER BY name DESC, id DESC LIMIT 1",
            &[json!(work_env_id)],
        )
        .await
    }

    async fn software(&self, id: i64) -> Result<Option<Software>> {
        self.by_id("softwares", id).await
    }

    async fn export(&self, id: i64) -> Result<Option<Export>> {
        self.by_id("exports", id).await
    }

    async fn export_by_name(&self, variant_id: i64, name: &str) -> Result<Option<Export>> {
        self.one(
            PROJECT,
            "SELECT * FROM exports WHERE variant_id = %s AND name = %s",
            &[json!(variant_id), json!(name)],
        )
        .await
    }

    async fn export_version(&self, id: i64) -> Result<Option<ExportVersion>> {
        self.by_id("export_versions", id).await
    }

    async fn last_export_version(&self, export_id: i64) -> Result<Option<ExportVersion>> {
        self.one(
            PROJECT,
            "SELECT * FROM export_versions WHERE export_id = %s ORDER BY name DESC, id DESC LIMIT 1",
            &[json!(export_id)],
        )
        .await
    }

    async fn insert_version(&self, version: NewVersion) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO versions (name, creation_time, creation_user, comment, file_path, \
             screenshot_path, thumbnail_path, string, work_env_id) \
             VALUES (%s, %s, %s, %s, %s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(version.name),
                json!(now_timestamp()),
                json!(version.creation_user),
                json!(version.comment),
                json!(version.file_path),
                json!(version.screenshot_path),
                json!(version.thumbnail_path),
                json!(version.string),
                json!(version.work_env_id),
            ],
        )
        .await
    }

    async fn insert_export(&self, export: NewExport) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO exports (name, creation_time, creation_user, variant_id, string) \
             VALUES (%s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(export.name),
                json!(now_timestamp()),
                json!(export.creation_user),
                json!(export.variant_id),
                json!(export.string),
            ],
        )
        .await
    }

    async fn insert_export_version(&self, version: NewExportVersion) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO export_versions (name, creation_time, creation_user, comment, files, \
             variant_id, work_version_id, work_version_thumbnail_path, software, string, export_id) \
             VALUES (%s, %s, %s, %s, %s, %s, %s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(version.name),
                json!(now_timestamp()),
                json!(version.creation_user),
                json!(version.comment),
                json!(serde_json::to_string(&version.files)?),
                json!(version.variant_id),
                json!(version.work_version_id),
                json!(version.work_version_thumbnail_path),
                json!(version.software),
                json!(version.string),
                json!(version.export_id),
            ],
        )
        .await
    }

    async fn set_work_env_lock(&self, work_env_id: i64, user_id: Option<i64>) -> Result<()> {
        self.exec(
            PROJECT,
            "UPDATE work_envs SET lock_id = %s WHERE id = %s",
            &[json!(user_id), json!(work_env_id)],
        )
        .await
    }

    async fn add_work_time(&self, work_env_id: i64, seconds: f64) -> Result<()> {
        self.exec(
            PROJECT,
            "UPDATE work_envs SET work_time = COALESCE(work_time, 0) + %s WHERE id = %s",
            &[json!(seconds), json!(work_env_id)],
        )
        .await
    }

    async fn locked_work_envs(&self, user_id: i64) -> Result<Vec<i64>> {
        let rows = self
            .db
            .fetch_all(
                PROJECT,
                "SELECT id FROM work_envs WHERE lock_id = %s",
                &[json!(user_id)],
            )
            .await
            .ok_or_else(|| Error::CatalogUnavailable("locked work envs".into()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_i64))
            .collect())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO events (creation_user, creation_time, type, title, message, data, \
             additional_message, image_path) \
             VALUES (%s, %s, %s, %s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(event.creation_user),
                json!(now_timestamp()),
                json!(event.kind),
                json!(event.title),
                json!(event.message),
                json!(event.data.to_string()),
                json!(event.additional_message),
                json!(event.image_path),
            ],
        )
        .await
    }

    async fn instance_string(&self, kind: InstanceKind, id: i64) -> Result<Option<String>> {
        let sql = format!("SELECT string FROM {} WHERE id = %s", kind.table());
        let row = self.db.fetch_one(PROJECT, &sql, &[json!(id)]).await;
        Ok(row.and_then(|row| row.get("string").and_then(Value::as_str).map(String::from)))
    }

    async fn set_event_message(&self, event_id: i64, message: &str) -> Result<()> {
        self.exec(
            PROJECT,
            "UPDATE events SET message = %s WHERE id = %s",
            &[json!(message), json!(event_id)],
        )
        .await
    }

    async fn references(&self, work_env_id: i64) -> Result<Vec<Reference>> {
        self.all(
            PROJECT,
            "SELECT * FROM references_data WHERE work_env_id = %s ORDER BY id",
            &[json!(work_env_id)],
        )
        .await
    }

    async fn set_reference_export(
        &self,
        reference_id: i64,
        export_id: i64,
        export_version_id: i64,
    ) -> Result<()> {
        self.exec(
            PROJECT,
            "UPDATE references_data SET export_id = %s, export_version_id = %s WHERE id = %s",
            &[json!(export_id), json!(export_version_id), json!(reference_id)],
        )
        .await
    }

    async fn variant_exports(&self, variant_id: i64) -> Result<Vec<Export>> {
        self.all(
            PROJECT,
            "SELECT * FROM exports WHERE variant_id = %s ORDER BY id",
            &[json!(variant_id)],
        )
        .await
    }

    async fn stage_by_name(&self, asset_id: i64, name: &str) -> Result<Option<Stage>> {
        self.one(
            PROJECT,
            "SELECT * FROM stages WHERE asset_id = %s AND name = %s",
            &[json!(asset_id), json!(name)],
        )
        .await
    }

    async fn work_env_by_name(&self, variant_id: i64, name: &str) -> Result<Option<WorkEnv>> {
        self.one(
            PROJECT,
            "SELECT * FROM work_envs WHERE variant_id = %s AND name = %s",
            &[json!(variant_id), json!(name)],
        )
        .await
    }

    async fn software_by_name(&self, name: &str) -> Result<Option<Software>> {
        self.one(
            PROJECT,
            "SELECT * FROM softwares WHERE name = %s",
            &[json!(name)],
        )
        .await
    }

    async fn insert_stage(&self, stage: NewStage) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO stages (name, creation_time, creation_user, string, asset_id) \
             VALUES (%s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(stage.name),
                json!(now_timestamp()),
                json!(stage.creation_user),
                json!(stage.string),
                json!(stage.asset_id),
            ],
        )
        .await
    }

    async fn insert_variant(&self, variant: NewVariant) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO variants (name, creation_time, creation_user, comment, string, stage_id) \
             VALUES (%s, %s, %s, %s, %s, %s) RETURNING id",
            &[
                json!(variant.name),
                json!(now_timestamp()),
                json!(variant.creation_user),
                json!(variant.comment),
                json!(variant.string),
                json!(variant.stage_id),
            ],
        )
        .await
    }

    async fn set_stage_default_variant(&self, stage_id: i64, variant_id: i64) -> Result<()> {
        self.exec(
            PROJECT,
            "UPDATE stages SET default_variant_id = %s WHERE id = %s",
            &[json!(variant_id), json!(stage_id)],
        )
        .await
    }

    async fn insert_work_env(&self, work_env: NewWorkEnv) -> Result<i64> {
        self.insert_returning(
            "INSERT INTO work_envs (name, creation_time, creation_user, variant_id, lock_id, \
             export_extension, work_time, string, software_id) \
             VALUES (%s, %s, %s, %s, NULL, %s, 0, %s, %s) RETURNING id",
            &[
                json!(work_env.name),
                json!(now_timestamp()),
                json!(work_env.creation_user),
                json!(work_env.variant_id),
                json!(work_env.export_extension),
                json!(work_env.string),
                json!(work_env.software_id),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{Mutex, Notify};
    use wizard_protocol::{FramedServer, FramedServerConfig};

    /// Proxy stand-in answering from a queue and recording requests.
    async fn scripted_proxy(replies: Vec<Value>) -> (DbClient, Arc<Mutex<Vec<Value>>>) {
        let server = FramedServer::bind(FramedServerConfig::loopback(0))
            .await
            .unwrap();
        let port = server.local_addr().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(replies.into_iter()));
        let seen_handler = seen.clone();
        tokio::spawn(server.run(
            move |mut stream, _| {
                let seen = seen_handler.clone();
                let replies = replies.clone();
                async move {
                    if let Ok(request) = stream.read_value().await {
                        seen.lock().await.push(request);
                        let reply = replies.lock().await.next().unwrap_or(Value::Null);
                        let _ = stream.write_value(&reply).await;
                    }
                }
            },
            Arc::new(Notify::new()),
        ));
        (DbClient::new(port), seen)
    }

    #[tokio::test]
    async fn test_user_id_targets_repository() {
        let (db, seen) = scripted_proxy(vec![json!({"id": 7, "user_name": "lea"})]).await;
        let catalog = ProxyCatalog::new(db);
        assert_eq!(catalog.user_id("lea").await.unwrap(), Some(7));

        let seen = seen.lock().await;
        assert_eq!(seen[0]["level"], "repository");
        assert_eq!(seen[0]["data"], json!(["lea"]));
    }

    #[tokio::test]
    async fn test_project_settings_decodes_text_columns() {
        let (db, _) = scripted_proxy(vec![json!({
            "id": 1,
            "frame_rate": 24.0,
            "image_format": "[1920, 1080]",
            "users_ids": "[1, 4]"
        })])
        .await;
        let settings = ProxyCatalog::new(db).project_settings().await.unwrap();
        assert_eq!(settings.frame_rate, Some(24.0));
        assert_eq!(settings.image_format, json!([1920, 1080]));
        assert_eq!(settings.users_ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_insert_event_stores_data_as_text() {
        let (db, seen) = scripted_proxy(vec![json!({"id": 31})]).await;
        let catalog = ProxyCatalog::new(db);
        let id = catalog
            .insert_event(NewEvent {
                kind: "tag".into(),
                title: "Tagged lea in a comment".into(),
                message: "@lea look".into(),
                data: json!({"instance": ["work_version", 3], "tagged_user": "lea"}),
                additional_message: None,
                image_path: None,
                creation_user: "max".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, 31);

        let seen = seen.lock().await;
        let data = seen[0]["data"].as_array().unwrap();
        assert!(data[5].is_string());
        assert!(data[6].is_null());
    }

    #[tokio::test]
    async fn test_unreachable_proxy_surfaces_as_error_on_writes() {
        let (db, _) = scripted_proxy(vec![]).await;
        let catalog = ProxyCatalog::new(db);
        assert!(matches!(
            catalog.set_work_env_lock(1, None).await,
            Err(Error::CatalogUnavailable(_))
        ));
        assert_eq!(catalog.work_env(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_event_message_statement() {
        let (db, seen) = scripted_proxy(vec![json!(1)]).await;
        let catalog = ProxyCatalog::new(db);
        catalog.set_event_message(9, "fixed typo").await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen[0]["fetch"], 0);
        assert_eq!(seen[0]["data"], json!(["fixed typo", 9]));
    }
}
