// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Software-command bridge.
//!
//! DCC plugins talk to the coordinator through this loopback server. Each
//! connection carries one `{"function": <name>, ...}` request and gets one
//! reply; anything that fails is answered with `null`.

pub mod copy;
pub mod ops;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use wizard_protocol::{FramedServer, FramedServerConfig, FramedStream, ServerError};

pub use copy::{CopyJob, CopyPool, DEFER_BYTES, DEFER_FILES, FollowUp};
pub use ops::BridgeOps;

use crate::env::Environment;
use crate::error::Result;

/// A request from a DCC plugin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum BridgeRequest {
    AddVersion {
        work_env_id: i64,
        #[serde(default)]
        comment: Option<String>,
    },
    RequestExport {
        work_env_id: i64,
        export_name: String,
        #[serde(default)]
        multiple: Option<Value>,
        #[serde(default)]
        only_dir: Option<bool>,
    },
    AddExportVersion {
        export_name: String,
        files: Vec<PathBuf>,
        work_env_id: i64,
        #[serde(default)]
        version_id: Option<i64>,
        #[serde(default)]
        comment: Option<String>,
    },
    RefreshTeam,
    GetFile {
        version_id: i64,
    },
    GetExportFormat {
        work_env_id: i64,
    },
    GetFrameRange {
        work_env_id: i64,
    },
    GetImageFormat,
    GetFrameRate,
    GetUserFolder,
    GetLocalPath,
    GetProjectPath,
    GetHooksFolder,
    GetPluginsFolder,
    GetStringVariantFromWorkEnvId {
        work_env_id: i64,
    },
    GetReferences {
        work_env_id: i64,
    },
    #[serde(rename = "modify_reference_LOD")]
    ModifyReferenceLod {
        work_env_id: i64,
        #[serde(rename = "LOD")]
        lod: String,
        namespaces_list: Vec<String>,
    },
    GetExportNameFromReferenceNamespace {
        reference_namespace: String,
        work_env_id: i64,
    },
    CreateOrGetCameraWorkEnv {
        work_env_id: i64,
    },
    CreateOrGetRenderingWorkEnv {
        work_env_id: i64,
    },
}

/// `multiple` arrives as a string or a frame number.
fn multiple_suffix(multiple: Option<Value>) -> Option<String> {
    match multiple? {
        Value::String(s) => Some(s),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

/// Run one request; the reply is what goes back on the wire.
pub async fn dispatch(ops: &BridgeOps, request: BridgeRequest) -> Result<Value> {
    let services = ops.services();
    let value = match request {
        BridgeRequest::AddVersion {
            work_env_id,
            comment,
        } => json!(
            ops.add_version(work_env_id, comment.as_deref().unwrap_or_default())
                .await?
        ),
        BridgeRequest::RequestExport {
            work_env_id,
            export_name,
            multiple,
            only_dir,
        } => {
            let multiple = multiple_suffix(multiple);
            json!(
                ops.request_export(
                    work_env_id,
                    &export_name,
                    multiple.as_deref(),
                    only_dir.unwrap_or(false)
                )
                .await?
            )
        }
        BridgeRequest::AddExportVersion {
            export_name,
            files,
            work_env_id,
            version_id,
            comment,
        } => json!(
            ops.add_export_version(
                &export_name,
                &files,
                work_env_id,
                version_id,
                comment.as_deref().unwrap_or_default()
            )
            .await?
        ),
        BridgeRequest::RefreshTeam => json!(services.refresh_team().await),
        BridgeRequest::GetFile { version_id } => json!(ops.get_file(version_id).await?),
        BridgeRequest::GetExportFormat { work_env_id } => {
            json!(ops.get_export_format(work_env_id).await?)
        }
        BridgeRequest::GetFrameRange { work_env_id } => {
            json!(ops.get_frame_range(work_env_id).await?)
        }
        BridgeRequest::GetImageFormat => ops.get_image_format().await?,
        BridgeRequest::GetFrameRate => json!(ops.get_frame_rate().await?),
        BridgeRequest::GetUserFolder => json!(services.user_folder),
        BridgeRequest::GetLocalPath => json!(services.local_path),
        BridgeRequest::GetProjectPath => json!(services.project_path()?),
        BridgeRequest::GetHooksFolder => json!(services.hooks_folder()?),
        BridgeRequest::GetPluginsFolder => json!(services.plugins_folder()?),
        BridgeRequest::GetStringVariantFromWorkEnvId { work_env_id } => {
            json!(ops.get_string_variant(work_env_id).await?)
        }
        BridgeRequest::GetReferences { work_env_id } => ops.get_references(work_env_id).await?,
        BridgeRequest::ModifyReferenceLod {
            work_env_id,
            lod,
            namespaces_list,
        } => json!(
            ops.modify_reference_lod(work_env_id, &lod, &namespaces_list)
                .await?
        ),
        BridgeRequest::GetExportNameFromReferenceNamespace {
            reference_namespace,
            work_env_id,
        } => json!(
            ops.get_export_name_from_reference_namespace(&reference_namespace, work_env_id)
                .await?
        ),
        BridgeRequest::CreateOrGetCameraWorkEnv { work_env_id } => {
            json!(ops.create_or_get_camera_work_env(work_env_id).await?)
        }
        BridgeRequest::CreateOrGetRenderingWorkEnv { work_env_id } => {
            json!(ops.create_or_get_rendering_work_env(work_env_id).await?)
        }
    };
    Ok(value)
}

/// The bridge server, bound and ready to run.
pub struct Bridge {
    server: FramedServer,
    ops: BridgeOps,
}

impl Bridge {
    /// Bind the loopback `port` and publish it as
    /// `wizard_communicate_server_port`.
    pub async fn bind(
        ops: BridgeOps,
        env: &Environment,
        port: u16,
    ) -> std::result::Result<Self, ServerError> {
        let server = FramedServer::bind(FramedServerConfig::loopback(port)).await?;
        let port = server.local_addr().port();
        env.set_communicate_server_port(port);
        info!(port, "Software bridge bound");
        Ok(Self { server, ops })
    }

    /// Port the bridge listens on.
    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    /// Serve until `shutdown` is notified.
    #[instrument(skip_all, fields(port = self.port()))]
    pub async fn run(self, shutdown: Arc<Notify>) -> std::result::Result<(), ServerError> {
        let ops = self.ops;
        let result = self
            .server
            .run(
                move |stream, _peer| {
                    let ops = ops.clone();
                    async move { handle_connection(ops, stream).await }
                },
                shutdown,
            )
            .await;
        info!("Software bridge stopped");
        result
    }
}

async fn handle_connection(ops: BridgeOps, mut stream: FramedStream<TcpStream>) {
    let request = match stream.read_value().await {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Bridge connection closed before a request");
            return;
        }
    };

    let function = request
        .get("function")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();
    let reply = match serde_json::from_value::<BridgeRequest>(request) {
        Ok(request) => match dispatch(&ops, request).await {
            Ok(value) => value,
            Err(e) => {
                error!(function = %function, error = %e, "Bridge function failed");
                Value::Null
            }
        },
        Err(e) => {
            warn!(function = %function, error = %e, "Unknown or malformed bridge request");
            Value::Null
        }
    };

    if let Err(e) = stream.write_value(&reply).await {
        error!(function = %function, error = %e, "Failed to send bridge reply");
    }
}
