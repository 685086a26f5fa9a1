// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Query functions take a `&PgPool` so they can be reused outside the
//! [`Persistence`] trait (admin tooling, migrations checks).

use chrono::Utc;
use sqlx::PgPool;

use crate::error::CoreError;

use super::{
    BuildStatus, BuildVersionRecord, EventLogRecord, Persistence, ServiceEventRecord,
    VersionInfoRecord, require_non_empty,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    ///
    /// The pool must already be migrated (see [`crate::migrations::run_postgres`]).
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Build Version Operations
// ============================================================================

const BUILD_VERSION_COLUMNS: &str = "plugin_id, version_id, deploy_version, kind, base_image, \
     build_local_image, git_url, repo_ref, info, status, container_cpu, container_memory, \
     container_cmd, build_time";

/// Fetch one build version.
pub async fn get_build_version(
    pool: &PgPool,
    plugin_id: &str,
    version_id: &str,
) -> Result<Option<BuildVersionRecord>, CoreError> {
    let sql = format!(
        "SELECT {} FROM build_versions WHERE plugin_id = $1 AND version_id = $2",
        BUILD_VERSION_COLUMNS
    );
    let record = sqlx::query_as::<_, BuildVersionRecord>(&sql)
        .bind(plugin_id)
        .bind(version_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Insert or update a build version keyed by `(plugin_id, version_id)`.
pub async fn upsert_build_version(
    pool: &PgPool,
    record: &BuildVersionRecord,
) -> Result<(), CoreError> {
    require_non_empty("plugin_id", &record.plugin_id)?;
    require_non_empty("version_id", &record.version_id)?;
    let record = record.clone().with_resource_defaults();

    sqlx::query(
        r#"
        INSERT INTO build_versions (
            plugin_id, version_id, deploy_version, kind, base_image, build_local_image,
            git_url, repo_ref, info, status, container_cpu, container_memory,
            container_cmd, build_time, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
        ON CONFLICT (plugin_id, version_id) DO UPDATE SET
            deploy_version = COALESCE(NULLIF(EXCLUDED.deploy_version, ''), build_versions.deploy_version),
            kind = COALESCE(NULLIF(EXCLUDED.kind, ''), build_versions.kind),
            base_image = COALESCE(EXCLUDED.base_image, build_versions.base_image),
            build_local_image = COALESCE(EXCLUDED.build_local_image, build_versions.build_local_image),
            git_url = COALESCE(EXCLUDED.git_url, build_versions.git_url),
            repo_ref = COALESCE(EXCLUDED.repo_ref, build_versions.repo_ref),
            info = EXCLUDED.info,
            status = EXCLUDED.status,
            container_cpu = EXCLUDED.container_cpu,
            container_memory = EXCLUDED.container_memory,
            container_cmd = COALESCE(EXCLUDED.container_cmd, build_versions.container_cmd),
            build_time = EXCLUDED.build_time,
            updated_at = NOW()
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
    .execute(pool)
    .await?;

    Ok(())
}

/// Transition `building` -> `timeout`. Returns true if a row changed.
pub async fn mark_build_version_timeout(
    pool: &PgPool,
    plugin_id: &str,
    version_id: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE build_versions
        SET status = 'timeout', updated_at = NOW()
        WHERE plugin_id = $1 AND version_id = $2 AND status = 'building'
        "#,
    )
    .bind(plugin_id)
    .bind(version_id)
    .execute(pool)
    .await?;

    let applied = result.rows_affected() > 0;
    if !applied {
        tracing::debug!(plugin_id, version_id, "Build version no longer building, timeout skipped");
    }
    Ok(applied)
}

// ============================================================================
// Service Event Operations
// ============================================================================

/// Set a terminal status on an in-flight event. Returns true if a row changed.
pub async fn finish_service_event(
    pool: &PgPool,
    event_id: &str,
    final_status: &str,
    message: Option<&str>,
) -> Result<bool, CoreError> {
    require_non_empty("final_status", final_status)?;
    let result = sqlx::query(
        r#"
        UPDATE service_events
        SET final_status = $1, message = COALESCE($2, message), end_time = NOW()
        WHERE event_id = $3 AND final_status = ''
        "#,
    )
    .bind(final_status)
    .bind(message)
    .bind(event_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn get_build_version(
        &self,
        plugin_id: &str,
        version_id: &str,
    ) -> Result<BuildVersionRecord, CoreError> {
        get_build_version(&self.pool, plugin_id, version_id)
            .await?
            .ok_or_else(|| CoreError::BuildVersionNotFound {
                plugin_id: plugin_id.to_string(),
                version_id: version_id.to_string(),
            })
    }

    async fn upsert_build_version(&self, record: &BuildVersionRecord) -> Result<(), CoreError> {
        upsert_build_version(&self.pool, record).await
    }

    async fn delete_build_version(&self, version_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM build_versions WHERE version_id = $1")
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
            "SELECT {} FROM build_versions WHERE plugin_id = $1 ORDER BY build_time DESC",
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
        mark_build_version_timeout(&self.pool, plugin_id, version_id).await
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
            SET status = $1, build_local_image = COALESCE($2, build_local_image), updated_at = NOW()
            WHERE plugin_id = $3 AND version_id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(build_local_image)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            WHERE event_id = $1
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
        finish_service_event(&self.pool, event_id, final_status, message).await
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (service_id, build_version) DO UPDATE SET
                event_id = EXCLUDED.event_id,
                delivered_type = EXCLUDED.delivered_type,
                delivered_path = EXCLUDED.delivered_path,
                image_name = EXCLUDED.image_name,
                repo_url = COALESCE(EXCLUDED.repo_url, version_infos.repo_url),
                code_version = COALESCE(EXCLUDED.code_version, version_infos.code_version),
                commit_msg = COALESCE(EXCLUDED.commit_msg, version_infos.commit_msg),
                author = COALESCE(EXCLUDED.author, version_infos.author),
                final_status = EXCLUDED.final_status,
                finish_time = EXCLUDED.finish_time
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
            WHERE service_id = $1 AND build_version = $2
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
            "SELECT deploy_version FROM service_deploy_versions WHERE service_id = $1",
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
            VALUES ($1, $2, NOW())
            ON CONFLICT (service_id) DO UPDATE SET
                deploy_version = EXCLUDED.deploy_version,
                updated_at = NOW()
            "#,
        )
        .bind(service_id)
        .bind(deploy_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_share_status(&self, share_id: &str, status: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO app_shares (share_id, status, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (share_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(share_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_share_status(&self, share_id: &str) -> Result<Option<String>, CoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM app_shares WHERE share_id = $1")
                .bind(share_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    async fn append_event_log(&self, entry: &EventLogRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_logs (event_id, level, message, step, status, attributes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            WHERE event_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
