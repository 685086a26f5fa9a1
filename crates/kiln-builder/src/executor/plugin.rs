// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `plugin_image_build` and `plugin_dockerfile_build`.
//!
//! Both variants register the build version as `building` when the
//! dispatcher admits them and record `complete` or `failure` at the end. The building
//! timeout watcher runs beside them and may set `timeout` first; the final
//! write here is unconditional.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::persistence::{BuildKind, BuildStatus, BuildVersionRecord};
use tracing::{info, warn};

use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::sources::{CloneOptions, CodeSource, ImageBuildOptions, ImageName, RegistryAuth, clone_repository};
use crate::task::PluginBuildTask;
use crate::workdir;

/// Executor of plugin builds.
pub struct PluginBuild {
    task: PluginBuildTask,
    kind: BuildKind,
}

impl PluginBuild {
    /// Retag an existing image.
    pub fn from_image(task: PluginBuildTask) -> Self {
        Self {
            task,
            kind: BuildKind::Image,
        }
    }

    /// Build the Dockerfile of a git repository.
    pub fn from_dockerfile(task: PluginBuildTask) -> Self {
        Self {
            task,
            kind: BuildKind::Dockerfile,
        }
    }

    fn auth(&self) -> Option<RegistryAuth> {
        RegistryAuth::from_parts(self.task.user.as_deref(), self.task.password.as_deref())
    }

    fn record(&self) -> BuildVersionRecord {
        let mut record = BuildVersionRecord::new(&self.task.plugin_id, &self.task.version_id, self.kind);
        record.deploy_version = self.task.deploy_version.clone();
        record.info = self.task.info.clone();
        record.container_cpu = self.task.plugin_cpu;
        record.container_memory = self.task.plugin_memory;
        record.container_cmd = self.task.plugin_cmd.clone();
        match self.kind {
            BuildKind::Image => record.base_image = self.task.image_url.clone(),
            _ => {
                record.git_url = self.task.git_url.clone();
                record.repo_ref = Some(self.task.git_ref().to_string());
            }
        }
        record.with_resource_defaults()
    }

    async fn retag_image(&self, ctx: &BuildContext, logger: &dyn Logger) -> Result<String> {
        let source = self
            .task
            .image_url
            .as_deref()
            .ok_or_else(|| Error::Validation("image_url is required".to_string()))?;
        let name = ImageName::parse(source).map_err(|e| Error::Validation(e.to_string()))?;
        let target = format!(
            "{}/{}:{}_{}",
            ctx.settings.registry_domain,
            name.simple_name(),
            name.tag,
            self.task.plugin_id
        );
        let timeout = ctx.settings.image_timeout;

        let auth = self.auth();
        ctx.images.pull(source, auth.as_ref(), logger, timeout).await?;
        ctx.images.tag(source, &target).await?;
        ctx.images.push(&target, None, logger, timeout).await?;
        Ok(target)
    }

    async fn build_dockerfile(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>) -> Result<String> {
        let git_url = self
            .task
            .git_url
            .as_deref()
            .ok_or_else(|| Error::Validation("git_url is required".to_string()))?;
        let settings = &ctx.settings;
        let dir = workdir::plugin_source_dir(&settings.cache_dir, &self.task.tenant_id, &self.task.version_id);
        let _guard = ctx.workdirs.lock(&dir).await;

        let source = CodeSource {
            repo_url: git_url.to_string(),
            branch: self.task.git_ref().to_string(),
            user: self.task.user.clone(),
            password: self.task.password.clone(),
        };
        let options = CloneOptions {
            timeout: settings.clone_timeout,
            ssh_dir: settings.ssh_dir.clone(),
            github_proxy: settings.github_proxy.clone(),
        };
        clone_repository(&source, &dir, &options, logger.clone()).await?;

        let result = async {
            if !dir.join("Dockerfile").is_file() {
                return Err(Error::Validation(format!(
                    "no Dockerfile in {} ({})",
                    git_url,
                    self.task.git_ref()
                )));
            }
            let image = format!(
                "{}/plugin_{}:{}",
                settings.registry_domain, self.task.plugin_id, self.task.deploy_version
            );
            let options = ImageBuildOptions {
                tag: image.clone(),
                context: dir.clone(),
                ..Default::default()
            };
            ctx.images.build(&options, logger.as_ref(), settings.image_timeout).await?;
            ctx.images.push(&image, None, logger.as_ref(), settings.image_timeout).await?;
            Ok(image)
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), error = %e, "Failed to remove plugin checkout");
        }
        result
    }

    /// Record the version as `building`, creating it on the first build.
    ///
    /// Runs at admission, before the task waits for a pool slot, so the
    /// building timeout always finds the row.
    pub async fn register(&self, ctx: &BuildContext, logger: &dyn Logger) -> Result<()> {
        let record = match ctx
            .store
            .get_build_version(&self.task.plugin_id, &self.task.version_id)
            .await
        {
            Ok(existing) => BuildVersionRecord {
                info: self.task.info.clone().or(existing.info.clone()),
                status: BuildStatus::Building.as_str().to_string(),
                build_time: Utc::now(),
                ..existing
            }
            .with_resource_defaults(),
            Err(e) if e.is_not_found() => self.record(),
            Err(e) => return Err(e.into()),
        };
        ctx.store.upsert_build_version(&record).await?;

        let operator = self.task.operator.as_deref().unwrap_or("system");
        info!(
            plugin_id = %self.task.plugin_id,
            version_id = %self.task.version_id,
            kind = %self.kind,
            operator = %operator,
            "Plugin build registered"
        );
        logger.info(
            &format!(
                "Plugin {} version {} queued for build by {}",
                self.task.plugin_id, self.task.version_id, operator
            ),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        Ok(())
    }

    async fn finish_event(&self, ctx: &BuildContext, status: &str, message: Option<&str>) {
        if let Err(e) = ctx.store.finish_service_event(&self.task.event_id, status, message).await {
            warn!(event_id = %self.task.event_id, error = %e, "Failed to finish plugin build event");
        }
    }
}

#[async_trait]
impl TaskExecutor for PluginBuild {
    type Output = String;

    fn name(&self) -> &'static str {
        match self.kind {
            BuildKind::Image => "plugin_image_build",
            _ => "plugin_dockerfile_build",
        }
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<String> {
        logger.info(
            &format!("Start building plugin {} version {}", self.task.plugin_id, self.task.version_id),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        match self.kind {
            BuildKind::Image => self.retag_image(ctx, logger.as_ref()).await,
            _ => self.build_dockerfile(ctx, logger).await,
        }
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, image: String) -> Result<()> {
        ctx.store
            .finish_build_version(
                &self.task.plugin_id,
                &self.task.version_id,
                BuildStatus::Complete,
                Some(&image),
            )
            .await?;
        logger.info(
            &format!("Build plugin {} success", image),
            attrs([("step", "last"), ("status", "success")]),
        );
        self.finish_event(ctx, "success", None).await;
        Ok(())
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        ctx.store
            .finish_build_version(&self.task.plugin_id, &self.task.version_id, BuildStatus::Failure, None)
            .await?;
        self.finish_event(ctx, "failure", Some(&error.to_string())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, commit_files, harness};
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::config::BuildSettings;
    use crate::dispatcher::execute;
    use crate::event::EventLogManager;
    use crate::sources::{ImageCall, MockImageClient};
    use tempfile::TempDir;

    fn task() -> PluginBuildTask {
        PluginBuildTask {
            event_id: "e1".into(),
            tenant_id: "t1".into(),
            plugin_id: "p1".into(),
            version_id: "v1".into(),
            deploy_version: "20250301120000".into(),
            image_url: Some("docker.io/library/nginx:1.21".into()),
            git_url: None,
            repo: None,
            info: Some("first".into()),
            operator: None,
            user: None,
            password: None,
            plugin_cpu: 0,
            plugin_memory: 0,
            plugin_cmd: None,
        }
    }

    async fn admit_and_run(build: PluginBuild, h: &Harness, logger: &Arc<dyn Logger>) -> Result<()> {
        build.register(&h.ctx, logger.as_ref()).await?;
        execute(&build, &h.ctx, logger).await
    }

    #[tokio::test]
    async fn test_image_plugin_is_retagged_with_plugin_suffix() {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        admit_and_run(PluginBuild::from_image(task()), &h, &logger).await.unwrap();

        assert_eq!(
            h.images.calls()[1],
            ImageCall::Tag {
                source: "docker.io/library/nginx:1.21".into(),
                target: "goodrain.me/nginx:1.21_p1".into()
            }
        );
        let record = h.store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Complete));
        assert_eq!(record.build_local_image.as_deref(), Some("goodrain.me/nginx:1.21_p1"));
        assert_eq!(record.base_image.as_deref(), Some("docker.io/library/nginx:1.21"));
        assert!(record.container_cpu > 0);
        assert_eq!(h.events.tagged("e1", "last", "success").len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_updates_existing_version() {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        admit_and_run(PluginBuild::from_image(task()), &h, &logger).await.unwrap();

        let mut again = task();
        again.info = Some("second".into());
        admit_and_run(PluginBuild::from_image(again), &h, &logger).await.unwrap();

        let versions = h.store.list_build_versions("p1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].info.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_push_failure_marks_version_failed() {
        let h = harness(
            BuildSettings::default(),
            MockImageClient::new().fail_operation("push"),
            RecordingCallback::new(),
        )
        .await;
        let logger = h.events.get_logger("e1");

        assert!(admit_and_run(PluginBuild::from_image(task()), &h, &logger).await.is_err());

        assert_eq!(h.images.count("push"), 3);
        let record = h.store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Failure));
    }

    #[tokio::test]
    async fn test_dockerfile_plugin_builds_repository() {
        let upstream = TempDir::new().unwrap();
        commit_files(upstream.path(), &[("Dockerfile", "FROM alpine\n")]);
        let cache = TempDir::new().unwrap();
        let settings = BuildSettings {
            cache_dir: cache.path().to_path_buf(),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let mut task = task();
        task.image_url = None;
        task.git_url = Some(upstream.path().to_string_lossy().into_owned());
        task.repo = Some("release".into());

        admit_and_run(PluginBuild::from_dockerfile(task), &h, &logger).await.unwrap();

        let record = h.store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.kind, "dockerfile");
        assert_eq!(record.repo_ref.as_deref(), Some("release"));
        assert_eq!(
            record.build_local_image.as_deref(),
            Some("goodrain.me/plugin_p1:20250301120000")
        );
        assert!(!workdir::plugin_source_dir(cache.path(), "t1", "v1").exists());
    }

    #[tokio::test]
    async fn test_repository_without_dockerfile_fails_once() {
        let upstream = TempDir::new().unwrap();
        commit_files(upstream.path(), &[("README.md", "plugin")]);
        let cache = TempDir::new().unwrap();
        let settings = BuildSettings {
            cache_dir: cache.path().to_path_buf(),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let mut task = task();
        task.git_url = Some(upstream.path().to_string_lossy().into_owned());
        task.repo = Some("release".into());

        let err = admit_and_run(PluginBuild::from_dockerfile(task), &h, &logger)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(h.images.calls().is_empty());
        let record = h.store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Failure));
    }

    #[tokio::test]
    async fn test_register_marks_building_and_names_the_operator() {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let mut task = task();
        task.operator = Some("alice".into());

        PluginBuild::from_image(task).register(&h.ctx, logger.as_ref()).await.unwrap();

        let record = h.store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Building));
        assert!(h.images.calls().is_empty());
        let entries = h.events.tagged("e1", "builder-exector", "starting");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.contains("by alice"));
    }
}
