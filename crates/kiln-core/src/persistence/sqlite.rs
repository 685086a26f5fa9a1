// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations;

use super::{
    BuildStatus, BuildVersionRecord, EventLogRecord, Persistence, ServiceEventRecord,
    VersionInfoRecord, require_non_empty,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/kiln.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Create a private in-memory database (single connection) with migrations applied.
    pub async fn in_memory() -> Result<Self, CoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const BUILD_VERSION_COLUMNS: &str = "plugin_id, version_id, deploy_version, kind, base_image, \
     build_local_image, git_url, repo_ref, info, status, container_cpu, container_memory, \
     container_cmd, build_time";

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn get_build_version(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> Result<BuildVersionRecord, CoreError> {
        let sql = format!(
            "SELECT {} FROM build_versions WHERE plugin_id = ? AND version_id = ?",
            BUILD_VERSION_COLUMNS
        );
        sqlx::query_as::<_, BuildVersionRecord>(&sql)
            .bind(plugin_id)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::BuildVersionNotFound {
                plugin_id: plugin_id.to_string(),
                version_id: version_id.to_string(),
            })
    }

    async fn upsert_build_version(&self, record: &BuildVersionRecord) -> Result<(), CoreError> {
        require_non_empty("plugin_id", &record.plugin_id)?;
        require_non_empty("version_id", &record.version_id)?;
        let record = record.clone().with_resource_defaults();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO build_versions (
                plugin_id, version_id, deploy_version, kind, base_image, build_local_image,
                git_url, repo_ref, info, status, container_cpu, container_memory,
                container_cmd, build_time, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (plugin_id, version_id) DO UPDATE SET
                deploy_version = CASE WHEN excluded.deploy_version = ''
                    THEN build_versions.deploy_version ELSE excluded.deploy_version END,
                kind = CASE WHEN excluded.kind = ''
                    THEN build_versions.kind ELSE excluded.kind END,
                base_image = COALESCE(excluded.base_image, build_versions.base_image),
                build_local_image = COALESCE(excluded.build_local_image, build_versions.build_local_image),
                git_url = COALESCE(excluded.git_url, build_versions.git_url),
                repo_ref = COALESCE(excluded.repo_ref, build_versions.repo_ref),
                info = excluded.info,
                status = excluded.status,
                container_cpu = excluded.container_cpu,
                container_memory = excluded.container_memory,
                container_cmd = COALESCE(excluded.container_cmd, build_versions.container_cmd),
                build_time = excluded.build_time,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.plugin_id)
        .bind(&record.version_id)
        .bind(&record.deploy_version)
        .bind(&record.kind)
        .bind(&record.base_image)
        .bind(&record.build_local_image)
        .bind(&record.git_url)
        .bind(&record.repo_ref)
        .bind(&record.info)
        .bind(&record.status)
        .bind(record.container_cpu)
        .bind(record.container_memory)
        .bind(&record.container_cmd)
        .bind(record.build_time)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_build_version(&self, version_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM build_versions WHERE version_id = ?")
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_build_versions(
        &self,
        plugin_id: &str,
    ) -> Result<Vec<BuildVersionRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM build_versions WHERE plugin_id = ? ORDER BY build_time DESC",
            BUILD_VERSION_COLUMNS
        );
        let records = sqlx::query_as::<_, BuildVersionRecord>(&sql)
            .bind(plugin_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn mark_build_version_timeout(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE build_versions
            SET status = 'timeout', updated_at = ?
            WHERE plugin_id = ? AND version_id = ? AND status = 'building'
            "#,
        )
        .bind(Utc::now())
        .bind(plugin_id)
        .bind(version_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::debug!(plugin_id, version_id, "Build version no longer building, timeout skipped");
        }
        Ok(applied)
    }

    async fn finish_build_version(
        &self,
        plugin_id: &str,
        version_id: &str,
        status: BuildStatus,
        build_local_image: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE build_versions
            SET status = ?, build_local_image = COALESCE(?, build_local_image), updated_at = ?
            WHERE plugin_id = ? AND version_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(build_local_image)
        .bind(Utc::now())
        .bind(plugin_id)
        .bind(version_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::BuildVersionNotFound {
                plugin_id: plugin_id.to_string(),
                version_id: version_id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_service_event(&self, event: &ServiceEventRecord) -> Result<(), CoreError> {
        require_non_empty("event_id", &event.event_id)?;
        sqlx::query(
            r#"
            INSERT INTO service_events (
                event_id, tenant_id, service_id, opt_type, deploy_version,
                old_deploy_version, final_status, message, start_time, end_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.tenant_id)
        .bind(&event.service_id)
        .bind(&event.opt_type)
        .bind(&event.deploy_version)
        .bind(&event.old_deploy_version)
        .bind(&event.final_status)
        .bind(&event.message)
        .bind(event.start_time)
        .bind(event.end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_service_event(&self, event_id: &str) -> Result<ServiceEventRecord, CoreError> {
        sqlx::query_as::<_, ServiceEventRecord>(
            r#"
            SELECT event_id, tenant_id, service_id, opt_type, deploy_version,
                   old_deploy_version, final_status, message, start_time, end_time
            FROM service_events
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::ServiceEventNotFound {
            event_id: event_id.to_string(),
        })
    }

    async fn finish_service_event(
        &self,
        event_id: &str,
        final_status: &str,
        message: Option<&str>,
    ) -> Result<bool, CoreError> {
        require_non_empty("final_status", final_status)?;
        let result = sqlx::query(
            r#"
            UPDATE service_events
            SET final_status = ?, message = COALESCE(?, message), end_time = ?
            WHERE event_id = ? AND final_status = ''
            "#,
        )
        .bind(final_status)
        .bind(message)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::debug!(event_id, final_status, "Service event already finished");
        }
        Ok(applied)
    }

    async fn upsert_version_info(&self, info: &VersionInfoRecord) -> Result<(), CoreError> {
        require_non_empty("service_id", &info.service_id)?;
        require_non_empty("build_version", &info.build_version)?;
        sqlx::query(
            r#"
            INSERT INTO version_infos (
                service_id, build_version, event_id, delivered_type, delivered_path,
                image_name, repo_url, code_version, commit_msg, author, final_status,
                finish_time, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (service_id, build_version) DO UPDATE SET
                event_id = excluded.event_id,
                delivered_type = excluded.delivered_type,
                delivered_path = excluded.delivered_path,
                image_name = excluded.image_name,
                repo_url = COALESCE(excluded.repo_url, version_infos.repo_url),
                code_version = COALESCE(excluded.code_version, version_infos.code_version),
                commit_msg = COALESCE(excluded.commit_msg, version_infos.commit_msg),
                author = COALESCE(excluded.author, version_infos.author),
                final_status = excluded.final_status,
                finish_time = excluded.finish_time
            "#,
        )
        .bind(&info.service_id)
        .bind(&info.build_version)
        .bind(&info.event_id)
        .bind(&info.delivered_type)
        .bind(&info.delivered_path)
        .bind(&info.image_name)
        .bind(&info.repo_url)
        .bind(&info.code_version)
        .bind(&info.commit_msg)
        .bind(&info.author)
        .bind(&info.final_status)
        .bind(info.finish_time)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_version_info(
        &self,
        service_id: &str,
        build_version: &str,
    ) -> Result<Option<VersionInfoRecord>, CoreError> {
        let record = sqlx::query_as::<_, VersionInfoRecord>(
            r#"
            SELECT service_id, build_version, event_id, delivered_type, delivered_path,
                   image_name, repo_url, code_version, commit_msg, author, final_status,
                   finish_time
            FROM version_infos
            WHERE service_id = ? AND build_version = ?
            "#,
        )
        .bind(service_id)
        .bind(build_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_service_deploy_version(
        &self,
        service_id: &str,
    ) -> Result<Option<String>, CoreError> {
        let version: Option<String> = sqlx::query_scalar(
            "SELECT deploy_version FROM service_deploy_versions WHERE service_id = ?",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    async fn set_service_deploy_version(
        &self,
        service_id: &str,
        deploy_version: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_deploy_versions (service_id, deploy_version, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (service_id) DO UPDATE SET
                deploy_version = excluded.deploy_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(service_id)
        .bind(deploy_version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_share_status(&self, share_id: &str, status: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO app_shares (share_id, status, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (share_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(share_id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_share_status(&self, share_id: &str) -> Result<Option<String>, CoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM app_shares WHERE share_id = ?")
                .bind(share_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    async fn append_event_log(&self, entry: &EventLogRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_logs (event_id, level, message, step, status, attributes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.level)
        .bind(&entry.message)
        .bind(&entry.step)
        .bind(&entry.status)
        .bind(&entry.attributes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_event_logs(&self, event_id: &str) -> Result<Vec<EventLogRecord>, CoreError> {
        let records = sqlx::query_as::<_, EventLogRecord>(
            r#"
            SELECT id, event_id, level, message, step, status, attributes, created_at
            FROM event_logs
            WHERE event_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
