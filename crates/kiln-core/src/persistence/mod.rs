// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for kiln-core.
//!
//! The builder talks to storage exclusively through [`Persistence`]. Two
//! backends are provided: [`SqlitePersistence`] for single-node deployments
//! and tests, and [`PostgresPersistence`] for production.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// CPU request applied when a build version does not specify one.
pub const DEFAULT_CONTAINER_CPU: i32 = 125;

/// Memory request (MiB) applied when a build version does not specify one.
pub const DEFAULT_CONTAINER_MEMORY: i32 = 50;

// ============================================================================
// Status and kind enums
// ============================================================================

/// Status of a build version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// A build attempt is in flight.
    Building,
    /// The artifact was produced.
    Complete,
    /// All attempts failed.
    Failure,
    /// The timeout watcher found the build still running past its deadline.
    Timeout,
}

impl BuildStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(Self::Building),
            "complete" => Ok(Self::Complete),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown build status '{}'", other),
            }),
        }
    }
}

/// What a build version is produced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    /// Retagged from an existing image.
    Image,
    /// Built from a Dockerfile in a git repository.
    Dockerfile,
    /// Compiled into a slug tarball.
    Slug,
}

impl BuildKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Dockerfile => "dockerfile",
            Self::Slug => "slug",
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Record types
// ============================================================================

/// One build attempt (and its outcome) for a plugin or service version.
///
/// Identity is `(plugin_id, version_id)`. Writes go through
/// [`Persistence::upsert_build_version`], so repeated builds of the same
/// version update this row instead of adding new ones.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct BuildVersionRecord {
    /// Plugin or service ID.
    pub plugin_id: String,
    /// Version ID.
    pub version_id: String,
    /// Deploy version the artifact is tagged with.
    pub deploy_version: String,
    /// Build kind (`image`, `dockerfile`, `slug`). Empty means "keep existing".
    pub kind: String,
    /// Source image for image builds.
    pub base_image: Option<String>,
    /// Produced image reference.
    pub build_local_image: Option<String>,
    /// Source repository for Dockerfile builds.
    pub git_url: Option<String>,
    /// Git ref (branch) for Dockerfile builds.
    pub repo_ref: Option<String>,
    /// Free-form description of the build.
    pub info: Option<String>,
    /// Current status (`building`, `complete`, `failure`, `timeout`).
    pub status: String,
    /// CPU request.
    pub container_cpu: i32,
    /// Memory request in MiB.
    pub container_memory: i32,
    /// Container command override.
    pub container_cmd: Option<String>,
    /// When the current build attempt started.
    pub build_time: DateTime<Utc>,
}

impl BuildVersionRecord {
    /// Create a record in `building` state with default resource requests.
    pub fn new(plugin_id: impl Into<String>, version_id: impl Into<String>, kind: BuildKind) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_id: version_id.into(),
            deploy_version: String::new(),
            kind: kind.as_str().to_string(),
            base_image: None,
            build_local_image: None,
            git_url: None,
            repo_ref: None,
            info: None,
            status: BuildStatus::Building.as_str().to_string(),
            container_cpu: DEFAULT_CONTAINER_CPU,
            container_memory: DEFAULT_CONTAINER_MEMORY,
            container_cmd: None,
            build_time: Utc::now(),
        }
    }

    /// Parsed status, if it is one of the known values.
    pub fn build_status(&self) -> Option<BuildStatus> {
        self.status.parse().ok()
    }

    /// Copy with unset (non-positive) resource requests replaced by defaults.
    pub fn with_resource_defaults(mut self) -> Self {
        if self.container_cpu <= 0 {
            self.container_cpu = DEFAULT_CONTAINER_CPU;
        }
        if self.container_memory <= 0 {
            self.container_memory = DEFAULT_CONTAINER_MEMORY;
        }
        self
    }
}

/// A lifecycle operation on a service, correlated by `event_id`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ServiceEventRecord {
    /// Correlation ID used across the whole pipeline.
    pub event_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Target service.
    pub service_id: String,
    /// Operation type (`build-service`, `upgrade`, ...).
    pub opt_type: String,
    /// Deploy version produced by this operation.
    pub deploy_version: String,
    /// Deploy version active before this operation.
    pub old_deploy_version: String,
    /// Empty while in flight, then exactly one terminal value.
    pub final_status: String,
    /// Optional human-readable outcome.
    pub message: Option<String>,
    /// When the operation began.
    pub start_time: DateTime<Utc>,
    /// When the operation reached its terminal status.
    pub end_time: Option<DateTime<Utc>>,
}

impl ServiceEventRecord {
    /// Create an in-flight event starting now.
    pub fn new(
        event_id: impl Into<String>,
        tenant_id: impl Into<String>,
        service_id: impl Into<String>,
        opt_type: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            tenant_id: tenant_id.into(),
            service_id: service_id.into(),
            opt_type: opt_type.into(),
            deploy_version: String::new(),
            old_deploy_version: String::new(),
            final_status: String::new(),
            message: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// True while no terminal status has been recorded.
    pub fn is_in_flight(&self) -> bool {
        self.final_status.is_empty()
    }
}

/// Delivered artifact of one service build.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct VersionInfoRecord {
    /// Service the artifact belongs to.
    pub service_id: String,
    /// Deploy version of the artifact.
    pub build_version: String,
    /// Event that produced it.
    pub event_id: String,
    /// `slug` or `image`.
    pub delivered_type: String,
    /// Slug path or image reference.
    pub delivered_path: String,
    /// Image name, for image deliveries.
    pub image_name: Option<String>,
    /// Source repository URL.
    pub repo_url: Option<String>,
    /// Commit hash of the built source.
    pub code_version: Option<String>,
    /// Commit message of the built source.
    pub commit_msg: Option<String>,
    /// Commit author of the built source.
    pub author: Option<String>,
    /// `success` or `failure`.
    pub final_status: String,
    /// When the build finished.
    pub finish_time: Option<DateTime<Utc>>,
}

/// One entry in an event's log stream.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EventLogRecord {
    /// Database primary key (None when inserting).
    #[sqlx(default)]
    pub id: Option<i64>,
    /// Event the entry belongs to.
    pub event_id: String,
    /// `info`, `error` or `debug`.
    pub level: String,
    /// Message text.
    pub message: String,
    /// Value of the `step` attribute, if any.
    pub step: Option<String>,
    /// Value of the `status` attribute, if any.
    pub status: Option<String>,
    /// All attributes as a JSON object.
    pub attributes: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

fn require_non_empty(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Store contract
// ============================================================================

/// Storage contract shared by every builder component.
///
/// Implementations must make [`mark_build_version_timeout`] and
/// [`finish_service_event`] conditional updates: they only transition rows
/// that are still in their in-flight state, and report whether they did.
///
/// [`mark_build_version_timeout`]: Persistence::mark_build_version_timeout
/// [`finish_service_event`]: Persistence::finish_service_event
#[async_trait]
pub trait Persistence: Send + Sync {
    // ----- build versions -------------------------------------------------

    /// Fetch a build version. Returns [`CoreError::BuildVersionNotFound`] if absent.
    async fn get_build_version(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> Result<BuildVersionRecord, CoreError>;

    /// Insert a build version, or update the existing row with the same identity.
    ///
    /// On update, empty `kind`/`deploy_version` and `None` source fields keep
    /// the stored values; `info`, `status`, resources and `build_time` are
    /// always overwritten.
    async fn upsert_build_version(&self, record: &BuildVersionRecord) -> Result<(), CoreError>;

    /// Delete every build version with the given version ID.
    async fn delete_build_version(&self, version_id: &str) -> Result<(), CoreError>;

    /// List the build versions of a plugin, newest build first.
    async fn list_build_versions(
        &self,
        plugin_id: &str,
    ) -> Result<Vec<BuildVersionRecord>, CoreError>;

    /// Set status to `timeout` only if the row is still `building`.
    ///
    /// Returns true if the transition happened.
    async fn mark_build_version_timeout(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> Result<bool, CoreError>;

    /// Record the terminal result of a build version.
    async fn finish_build_version(
        &self,
        plugin_id: &str,
        version_id: &str,
        status: BuildStatus,
        build_local_image: Option<&str>,
    ) -> Result<(), CoreError>;

    // ----- service events -------------------------------------------------

    /// Create a service event.
    async fn create_service_event(&self, event: &ServiceEventRecord) -> Result<(), CoreError>;

    /// Fetch a service event. Returns [`CoreError::ServiceEventNotFound`] if absent.
    async fn get_service_event(&self, event_id: &str) -> Result<ServiceEventRecord, CoreError>;

    /// Set the terminal status of an event that is still in flight.
    ///
    /// Returns false if the event already had a terminal status or does not exist.
    async fn finish_service_event(
        &self,
        event_id: &str,
        final_status: &str,
        message: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Mark an in-flight event as `timeout`.
    async fn mark_service_event_timeout(&self, event_id: &str) -> Result<bool, CoreError> {
        self.finish_service_event(event_id, "timeout", Some("operation timed out"))
            .await
    }

    // ----- version info and deploy versions ------------------------------

    /// Insert or replace the version info of a service build.
    async fn upsert_version_info(&self, info: &VersionInfoRecord) -> Result<(), CoreError>;

    /// Fetch the version info of a service build.
    async fn get_version_info(
        &self,
        service_id: &str,
        build_version: &str,
    ) -> Result<Option<VersionInfoRecord>, CoreError>;

    /// Current deploy version of a service.
    async fn get_service_deploy_version(
        &self,
        service_id: &str,
    ) -> Result<Option<String>, CoreError>;

    /// Set the deploy version of a service.
    async fn set_service_deploy_version(
        &self,
        service_id: &str,
        deploy_version: &str,
    ) -> Result<(), CoreError>;

    // ----- shares ---------------------------------------------------------

    /// Record the outcome of a share task.
    async fn update_share_status(&self, share_id: &str, status: &str) -> Result<(), CoreError>;

    /// Outcome of a share task, if recorded.
    async fn get_share_status(&self, share_id: &str) -> Result<Option<String>, CoreError>;

    // ----- event logs -----------------------------------------------------

    /// Append one entry to an event's log stream.
    async fn append_event_log(&self, entry: &EventLogRecord) -> Result<(), CoreError>;

    /// All entries of an event's log stream, oldest first.
    async fn list_event_logs(&self, event_id: &str) -> Result<Vec<EventLogRecord>, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_round_trip() {
        for status in [
            BuildStatus::Building,
            BuildStatus::Complete,
            BuildStatus::Failure,
            BuildStatus::Timeout,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_new_build_version_defaults() {
        let record = BuildVersionRecord::new("plugin-1", "v1", BuildKind::Image);
        assert_eq!(record.status, "building");
        assert_eq!(record.kind, "image");
        assert_eq!(record.container_cpu, 125);
        assert_eq!(record.container_memory, 50);
        assert_eq!(record.build_status(), Some(BuildStatus::Building));
    }

    #[test]
    fn test_resource_defaults_fill_unset_values() {
        let mut record = BuildVersionRecord::new("plugin-1", "v1", BuildKind::Image);
        record.container_cpu = 0;
        record.container_memory = -1;
        let record = record.with_resource_defaults();
        assert_eq!(record.container_cpu, DEFAULT_CONTAINER_CPU);
        assert_eq!(record.container_memory, DEFAULT_CONTAINER_MEMORY);

        let mut custom = BuildVersionRecord::new("plugin-1", "v1", BuildKind::Image);
        custom.container_cpu = 500;
        assert_eq!(custom.with_resource_defaults().container_cpu, 500);
    }

    #[test]
    fn test_service_event_starts_in_flight() {
        let event = ServiceEventRecord::new("e1", "t1", "s1", "build-service");
        assert!(event.is_in_flight());
        assert!(event.end_time.is_none());
    }
}
