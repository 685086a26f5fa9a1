// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build task model.
//!
//! Queue messages carry a `task_type` string and a JSON body whose shape
//! depends on that type. [`BuildTask::decode`] turns the pair into a typed
//! value once, at the dispatcher boundary; nothing past that point looks at
//! raw JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Every task type the dispatcher accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Legacy script: build an application image.
    AppImage,
    /// Retag and push an existing image for a service.
    BuildFromImage,
    /// Clone and build a service from source.
    BuildFromSourceCode,
    /// Install a slug from the application market.
    BuildFromMarketSlug,
    /// Legacy script: build an application slug.
    AppSlug,
    /// Legacy script: manual image handling.
    ImageManual,
    /// Legacy script: code check.
    CodeCheck,
    /// Validate a service source descriptor.
    ServiceCheck,
    /// Legacy script: application build.
    AppBuild,
    /// Build a plugin from an image.
    PluginImageBuild,
    /// Build a plugin from a Dockerfile repository.
    PluginDockerfileBuild,
    /// Publish a service slug.
    ShareSlug,
    /// Publish a service image.
    ShareImage,
}

impl TaskType {
    /// All task types, in wire order.
    pub const ALL: [TaskType; 13] = [
        Self::AppImage,
        Self::BuildFromImage,
        Self::BuildFromSourceCode,
        Self::BuildFromMarketSlug,
        Self::AppSlug,
        Self::ImageManual,
        Self::CodeCheck,
        Self::ServiceCheck,
        Self::AppBuild,
        Self::PluginImageBuild,
        Self::PluginDockerfileBuild,
        Self::ShareSlug,
        Self::ShareImage,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppImage => "app_image",
            Self::BuildFromImage => "build_from_image",
            Self::BuildFromSourceCode => "build_from_source_code",
            Self::BuildFromMarketSlug => "build_from_market_slug",
            Self::AppSlug => "app_slug",
            Self::ImageManual => "image_manual",
            Self::CodeCheck => "code_check",
            Self::ServiceCheck => "service_check",
            Self::AppBuild => "app_build",
            Self::PluginImageBuild => "plugin_image_build",
            Self::PluginDockerfileBuild => "plugin_dockerfile_build",
            Self::ShareSlug => "share-slug",
            Self::ShareImage => "share-image",
        }
    }

    /// True for types handled by an external plugin script.
    pub fn is_script(&self) -> bool {
        matches!(
            self,
            Self::AppImage | Self::AppSlug | Self::ImageManual | Self::CodeCheck | Self::AppBuild
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnsupportedTaskType(s.to_string()))
    }
}

fn default_branch() -> String {
    "master".to_string()
}

/// `build_from_source_code` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceCodeBuildTask {
    /// Correlation ID.
    pub event_id: String,
    /// Owning tenant ID.
    pub tenant_id: String,
    /// Tenant name used in the upgrade callback.
    #[serde(default)]
    pub tenant_name: String,
    /// Service ID.
    pub service_id: String,
    /// Service alias used in the upgrade callback.
    #[serde(default)]
    pub service_alias: String,
    /// Version the artifact is tagged with.
    pub deploy_version: String,
    /// Git repository URL.
    pub repo_url: String,
    /// Branch to build.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Basic-auth user for HTTP(S) repositories.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic-auth password for HTTP(S) repositories.
    #[serde(default)]
    pub password: Option<String>,
    /// Declared language. Detected from the checkout when empty.
    #[serde(default)]
    pub lang: String,
    /// Declared runtime version.
    #[serde(default)]
    pub runtime: String,
    /// Build environment (e.g. `NO_CACHE`).
    #[serde(default)]
    pub build_envs: BTreeMap<String, String>,
}

/// `build_from_image` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageBuildTask {
    /// Correlation ID.
    pub event_id: String,
    /// Owning tenant ID.
    pub tenant_id: String,
    /// Tenant name used in the upgrade callback.
    #[serde(default)]
    pub tenant_name: String,
    /// Service ID.
    pub service_id: String,
    /// Service alias used in the upgrade callback.
    #[serde(default)]
    pub service_alias: String,
    /// Version the image is tagged with.
    pub deploy_version: String,
    /// Source image reference.
    pub image: String,
    /// Registry user for the source image.
    #[serde(default)]
    pub user: Option<String>,
    /// Registry password for the source image.
    #[serde(default)]
    pub password: Option<String>,
}

/// `build_from_market_slug` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketSlugTask {
    /// Correlation ID.
    pub event_id: String,
    /// Owning tenant ID.
    pub tenant_id: String,
    /// Tenant name used in the upgrade callback.
    #[serde(default)]
    pub tenant_name: String,
    /// Service ID.
    pub service_id: String,
    /// Service alias used in the upgrade callback.
    #[serde(default)]
    pub service_alias: String,
    /// Version the slug is installed as.
    pub deploy_version: String,
    /// Path of the market slug to install.
    pub slug_path: String,
}

/// `plugin_image_build` / `plugin_dockerfile_build` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginBuildTask {
    /// Correlation ID.
    pub event_id: String,
    /// Owning tenant ID.
    pub tenant_id: String,
    /// Plugin ID.
    pub plugin_id: String,
    /// Build version ID.
    pub version_id: String,
    /// Version the image is tagged with.
    pub deploy_version: String,
    /// Source image (image builds).
    #[serde(default)]
    pub image_url: Option<String>,
    /// Repository URL (Dockerfile builds).
    #[serde(default)]
    pub git_url: Option<String>,
    /// Git ref (Dockerfile builds). Defaults to `master`.
    #[serde(default)]
    pub repo: Option<String>,
    /// Free-form build description.
    #[serde(default)]
    pub info: Option<String>,
    /// Who requested the build.
    #[serde(default)]
    pub operator: Option<String>,
    /// Registry/repository user.
    #[serde(default)]
    pub user: Option<String>,
    /// Registry/repository password.
    #[serde(default)]
    pub password: Option<String>,
    /// CPU request. Defaulted when unset.
    #[serde(default)]
    pub plugin_cpu: i32,
    /// Memory request in MiB. Defaulted when unset.
    #[serde(default)]
    pub plugin_memory: i32,
    /// Container command override.
    #[serde(default)]
    pub plugin_cmd: Option<String>,
}

impl PluginBuildTask {
    /// Ref to clone for Dockerfile builds.
    pub fn git_ref(&self) -> &str {
        self.repo
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or("master")
    }
}

/// `service_check` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceCheckTask {
    /// Correlation ID.
    pub event_id: String,
    /// ID the check result is reported under.
    #[serde(default)]
    pub check_uuid: String,
    /// `docker-run`, `docker-compose` or `sourcecode`.
    pub source_type: String,
    /// Docker command, compose file, or JSON code-source descriptor.
    pub source_body: String,
    /// Owning tenant ID.
    #[serde(default)]
    pub tenant_id: String,
    /// Registry user for pulling checked images.
    #[serde(default)]
    pub username: Option<String>,
    /// Registry password for pulling checked images.
    #[serde(default)]
    pub password: Option<String>,
}

/// `share-slug` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlugShareTask {
    /// Correlation ID.
    pub event_id: String,
    /// Share record ID.
    pub share_id: String,
    /// Key of the shared service.
    pub service_key: String,
    /// Shared application version.
    pub app_version: String,
    /// Slug to publish.
    pub local_slug_path: String,
}

/// `share-image` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageShareTask {
    /// Correlation ID.
    pub event_id: String,
    /// Share record ID.
    pub share_id: String,
    /// Key of the shared service.
    pub service_key: String,
    /// Shared application version.
    pub app_version: String,
    /// Local image to publish.
    pub image_name: String,
    /// Share registry user.
    #[serde(default)]
    pub share_user: Option<String>,
    /// Share registry password.
    #[serde(default)]
    pub share_password: Option<String>,
}

/// Payload of a legacy script task. The body is handed to the script as is.
#[derive(Debug, Clone)]
pub struct ScriptTask {
    /// Which script to run.
    pub task_type: TaskType,
    /// Correlation ID.
    pub event_id: String,
    /// Original task body.
    pub body: Value,
}

/// A decoded task.
#[derive(Debug, Clone)]
pub enum BuildTask {
    /// `build_from_source_code`.
    SourceCode(SourceCodeBuildTask),
    /// `build_from_image`.
    Image(ImageBuildTask),
    /// `build_from_market_slug`.
    MarketSlug(MarketSlugTask),
    /// `plugin_image_build`.
    PluginImage(PluginBuildTask),
    /// `plugin_dockerfile_build`.
    PluginDockerfile(PluginBuildTask),
    /// `service_check`.
    ServiceCheck(ServiceCheckTask),
    /// `share-slug`.
    ShareSlug(SlugShareTask),
    /// `share-image`.
    ShareImage(ImageShareTask),
    /// Any legacy script type.
    Script(ScriptTask),
}

impl BuildTask {
    /// Decode a task body for the given type.
    ///
    /// Unknown types yield [`Error::UnsupportedTaskType`]; a malformed body or
    /// a missing `event_id` yields [`Error::Validation`].
    pub fn decode(task_type: &str, body: &[u8]) -> Result<Self> {
        let task_type: TaskType = task_type.parse()?;
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("{} body is not valid JSON: {}", task_type, e)))?;
        Self::from_value(task_type, value)
    }

    /// Decode an already-parsed JSON body.
    pub fn from_value(task_type: TaskType, value: Value) -> Result<Self> {
        let event_id = value
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if event_id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "{} body has no event_id",
                task_type
            )));
        }

        let task = match task_type {
            TaskType::BuildFromSourceCode => Self::SourceCode(typed(task_type, value)?),
            TaskType::BuildFromImage => Self::Image(typed(task_type, value)?),
            TaskType::BuildFromMarketSlug => Self::MarketSlug(typed(task_type, value)?),
            TaskType::PluginImageBuild => Self::PluginImage(typed(task_type, value)?),
            TaskType::PluginDockerfileBuild => Self::PluginDockerfile(typed(task_type, value)?),
            TaskType::ServiceCheck => Self::ServiceCheck(typed(task_type, value)?),
            TaskType::ShareSlug => Self::ShareSlug(typed(task_type, value)?),
            TaskType::ShareImage => Self::ShareImage(typed(task_type, value)?),
            TaskType::AppImage
            | TaskType::AppSlug
            | TaskType::ImageManual
            | TaskType::CodeCheck
            | TaskType::AppBuild => Self::Script(ScriptTask {
                task_type,
                event_id: event_id.to_string(),
                body: value,
            }),
        };
        Ok(task)
    }

    /// The task's type.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::SourceCode(_) => TaskType::BuildFromSourceCode,
            Self::Image(_) => TaskType::BuildFromImage,
            Self::MarketSlug(_) => TaskType::BuildFromMarketSlug,
            Self::PluginImage(_) => TaskType::PluginImageBuild,
            Self::PluginDockerfile(_) => TaskType::PluginDockerfileBuild,
            Self::ServiceCheck(_) => TaskType::ServiceCheck,
            Self::ShareSlug(_) => TaskType::ShareSlug,
            Self::ShareImage(_) => TaskType::ShareImage,
            Self::Script(t) => t.task_type,
        }
    }

    /// Correlation ID of the task.
    pub fn event_id(&self) -> &str {
        match self {
            Self::SourceCode(t) => &t.event_id,
            Self::Image(t) => &t.event_id,
            Self::MarketSlug(t) => &t.event_id,
            Self::PluginImage(t) | Self::PluginDockerfile(t) => &t.event_id,
            Self::ServiceCheck(t) => &t.event_id,
            Self::ShareSlug(t) => &t.event_id,
            Self::ShareImage(t) => &t.event_id,
            Self::Script(t) => &t.event_id,
        }
    }

    /// Plugin build payload, for the tasks watched by the building timeout.
    pub fn plugin_build(&self) -> Option<&PluginBuildTask> {
        match self {
            Self::PluginImage(t) | Self::PluginDockerfile(t) => Some(t),
            _ => None,
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(task_type: TaskType, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("invalid {} body: {}", task_type, e)))
}

/// Message shape on the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Producer-assigned ID, if any.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Task type string.
    pub task_type: String,
    /// Task body.
    pub task_body: Value,
}

impl TaskEnvelope {
    /// Parse a raw queue message.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("malformed task envelope: {}", e)))
    }

    /// Body bytes as handed to [`BuildTask::decode`].
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.task_body)?)
    }
}
