// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `build_from_source_code`.
//!
//! Each attempt clones the repository into its deterministic checkout,
//! then either builds the repository's Dockerfile or compiles a slug with the
//! external build script. A Dockerfile always wins over language markers. The
//! checkout is removed when the attempt ends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use super::{Delivery, ServiceTarget, fail_service_build, finish_service_build};
use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::parser::dockerfile::parse_dockerfile;
use crate::parser::lang;
use crate::slug::{CompileRequest, run_build_script, verify_artifact};
use crate::sources::{CloneOptions, CodeSource, CommitInfo, ImageBuildOptions, clone_repository};
use crate::task::SourceCodeBuildTask;
use crate::workdir;

static REPO_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*(?:\:|\/)([\w\-\.]+)/([\w\-\.]+)\.git").expect("Invalid repository url regex")
});

/// Image reference of a Dockerfile build:
/// `<registry>/<serviceID[12..]>_<org>_<repo>:<deployVersion>`, lower-cased.
pub fn dockerfile_image_name(registry: &str, service_id: &str, repo_url: &str, deploy_version: &str) -> Result<String> {
    let captures = REPO_NAME
        .captures(repo_url)
        .ok_or_else(|| Error::Validation(format!("repository url {} does not name an org and repo", repo_url)))?;
    let service = service_id.get(12..).unwrap_or(service_id);
    Ok(format!(
        "{}/{}_{}_{}:{}",
        registry, service, &captures[1], &captures[2], deploy_version
    )
    .to_lowercase())
}

/// Executor of source-code builds.
pub struct SourceCodeBuild {
    task: SourceCodeBuildTask,
}

impl SourceCodeBuild {
    /// Executor for `task`.
    pub fn new(task: SourceCodeBuildTask) -> Self {
        Self { task }
    }

    fn target(&self) -> ServiceTarget {
        ServiceTarget {
            event_id: self.task.event_id.clone(),
            tenant_id: self.task.tenant_id.clone(),
            tenant_name: self.task.tenant_name.clone(),
            service_id: self.task.service_id.clone(),
            service_alias: self.task.service_alias.clone(),
            deploy_version: self.task.deploy_version.clone(),
        }
    }

    fn build_args(&self) -> BTreeMap<String, String> {
        self.task
            .build_envs
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("ARG_").map(|name| (name.to_string(), v.clone())))
            .collect()
    }

    async fn build_dockerfile(&self, ctx: &BuildContext, dir: &Path, logger: &dyn Logger) -> Result<Delivery> {
        let content = tokio::fs::read_to_string(dir.join("Dockerfile")).await?;
        parse_dockerfile(&content).map_err(|e| Error::Validation(format!("Dockerfile is invalid: {}", e)))?;

        let image = dockerfile_image_name(
            &ctx.settings.registry_domain,
            &self.task.service_id,
            &self.task.repo_url,
            &self.task.deploy_version,
        )?;
        logger.info(
            &format!("Start building image {} from Dockerfile", image),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );

        let options = ImageBuildOptions {
            tag: image.clone(),
            context: dir.to_path_buf(),
            dockerfile: None,
            build_args: self.build_args(),
            no_cache: self.task.build_envs.contains_key("NO_CACHE"),
        };
        ctx.images.build(&options, logger, ctx.settings.image_timeout).await?;
        ctx.images.push(&image, None, logger, ctx.settings.image_timeout).await?;
        info!(image = %image, service_id = %self.task.service_id, "Dockerfile image built");

        Ok(Delivery::image(image))
    }

    async fn compile_slug(&self, ctx: &BuildContext, dir: &Path, logger: &dyn Logger) -> Result<Delivery> {
        let language = if self.task.lang.is_empty() {
            lang::detect(dir)
                .map(|l| l.to_string())
                .ok_or_else(|| Error::Validation("the language of the code could not be recognised".to_string()))?
        } else {
            self.task.lang.clone()
        };

        let settings = &ctx.settings;
        let output_dir = workdir::slug_dir(&settings.data_dir, &self.task.tenant_id, &self.task.service_id);
        let request = CompileRequest {
            branch: self.task.branch.clone(),
            source_dir: dir.to_path_buf(),
            cache_dir: workdir::compile_cache_dir(&settings.cache_dir, &self.task.tenant_id, &self.task.service_id),
            log_file: output_dir.join(format!("{}.log", self.task.deploy_version)),
            output_dir,
            deploy_version: self.task.deploy_version.clone(),
            tenant_id: self.task.tenant_id.clone(),
            service_id: self.task.service_id.clone(),
            runtime: self.task.runtime.clone(),
            lang: language,
            build_name: if self.task.service_alias.is_empty() {
                self.task.service_id.clone()
            } else {
                self.task.service_alias.clone()
            },
            envs: self.task.build_envs.clone(),
        };

        logger.info(
            "Start compiling source code",
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        run_build_script(&settings.build_script, &request, logger, settings.compile_timeout).await?;

        let artifact = request.artifact_path();
        let size = verify_artifact(&artifact).await?;
        info!(path = %artifact.display(), size, "Slug compiled");

        Ok(Delivery::slug(artifact.to_string_lossy()))
    }
}

fn log_code_version(logger: &dyn Logger, commit: &CommitInfo) {
    logger.info(
        &format!(
            "CodeVersion:{} Author:{} Commit:{}",
            commit.short_hash(),
            commit.author,
            commit.message
        ),
        attrs([("step", "code-version")]),
    );
}

#[async_trait]
impl TaskExecutor for SourceCodeBuild {
    type Output = Delivery;

    fn name(&self) -> &'static str {
        "build_from_source_code"
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, attempt: u32) -> Result<Delivery> {
        let settings = &ctx.settings;
        let dir = workdir::source_dir(&settings.cache_dir, &self.task.tenant_id, &self.task.repo_url);
        let _guard = ctx.workdirs.lock(&dir).await;

        logger.info(
            &format!("Start clone code from {} ({}), attempt {}", self.task.repo_url, self.task.branch, attempt),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        let source = CodeSource {
            repo_url: self.task.repo_url.clone(),
            branch: self.task.branch.clone(),
            user: self.task.user.clone(),
            password: self.task.password.clone(),
        };
        let options = CloneOptions {
            timeout: settings.clone_timeout,
            ssh_dir: settings.ssh_dir.clone(),
            github_proxy: settings.github_proxy.clone(),
        };
        let repository = clone_repository(&source, &dir, &options, logger.clone()).await?;
        log_code_version(logger.as_ref(), &repository.head);

        let result = if dir.join("Dockerfile").is_file() {
            self.build_dockerfile(ctx, &dir, logger.as_ref()).await
        } else {
            self.compile_slug(ctx, &dir, logger.as_ref()).await
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), error = %e, "Failed to remove source checkout");
        }

        result.map(|delivery| Delivery {
            repo_url: Some(self.task.repo_url.clone()),
            commit: Some(repository.head),
            ..delivery
        })
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, delivery: Delivery) -> Result<()> {
        finish_service_build(ctx, logger.as_ref(), &self.target(), &delivery).await
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        fail_service_build(ctx, &self.target(), "", &error.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{commit_files, harness};
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::config::BuildSettings;
    use crate::dispatcher::execute;
    use crate::event::EventLogManager;
    use crate::sources::{ImageCall, MockImageClient};
    use tempfile::TempDir;

    fn task(repo_url: &Path) -> SourceCodeBuildTask {
        SourceCodeBuildTask {
            event_id: "e1".into(),
            tenant_id: "t1".into(),
            tenant_name: "acme".into(),
            service_id: "0123456789abcdef".into(),
            service_alias: "web".into(),
            deploy_version: "20250301120000".into(),
            repo_url: repo_url.to_string_lossy().into_owned(),
            branch: "release".into(),
            user: None,
            password: None,
            lang: String::new(),
            runtime: String::new(),
            build_envs: BTreeMap::new(),
        }
    }

    fn settings(root: &Path, script_body: &str) -> BuildSettings {
        let script = root.join("build.sh");
        std::fs::write(&script, script_body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        BuildSettings {
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
            build_script: script,
            ..Default::default()
        }
    }

    const WRITE_SLUG: &str = "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -d) out=\"$2\"; shift 2;;\n    -v) ver=\"$2\"; shift 2;;\n    *) shift;;\n  esac\ndone\nmkdir -p \"$out\"\necho slug > \"$out/$ver.tgz\"\n";
    const EMPTY_SLUG: &str = "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -d) out=\"$2\"; shift 2;;\n    -v) ver=\"$2\"; shift 2;;\n    *) shift;;\n  esac\ndone\nmkdir -p \"$out\"\n: > \"$out/$ver.tgz\"\n";

    #[tokio::test]
    async fn test_dockerfile_takes_precedence_over_markers() {
        let root = TempDir::new().unwrap();
        let upstream = root.path().join("acme/web.git");
        std::fs::create_dir_all(&upstream).unwrap();
        commit_files(&upstream, &[("Dockerfile", "FROM node:20\nEXPOSE 3000\n"), ("package.json", "{}")]);
        let mut task = task(&upstream);
        task.build_envs.insert("ARG_VERSION".into(), "2".into());
        task.build_envs.insert("NO_CACHE".into(), String::new());

        let h = harness(settings(root.path(), WRITE_SLUG), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        execute(&SourceCodeBuild::new(task), &h.ctx, &logger).await.unwrap();

        let image = "goodrain.me/cdef_acme_web:20250301120000".to_string();
        let calls = h.images.calls();
        assert!(matches!(&calls[0], ImageCall::Build { tag, no_cache: true, .. } if *tag == image));
        assert_eq!(
            calls[1],
            ImageCall::Push {
                image: image.clone(),
                authenticated: false
            }
        );
        let info = h.store.get_version_info("0123456789abcdef", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.delivered_type, "image");
        assert_eq!(info.author.as_deref(), Some("dev"));
        assert!(
            h.events
                .entries_for("e1")
                .iter()
                .any(|e| e.attr("step") == Some("code-version") && e.message.starts_with("CodeVersion:"))
        );
        assert!(!workdir::source_dir(&h.ctx.settings.cache_dir, "t1", &upstream.to_string_lossy()).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compiles_slug_without_dockerfile() {
        let root = TempDir::new().unwrap();
        let upstream = root.path().join("acme/api.git");
        std::fs::create_dir_all(&upstream).unwrap();
        commit_files(&upstream, &[("requirements.txt", "flask\n")]);

        let h = harness(settings(root.path(), WRITE_SLUG), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        execute(&SourceCodeBuild::new(task(&upstream)), &h.ctx, &logger).await.unwrap();

        let slug = workdir::slug_path(&root.path().join("data"), "t1", "0123456789abcdef", "20250301120000");
        assert!(slug.is_file());
        let info = h.store.get_version_info("0123456789abcdef", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.delivered_type, "slug");
        assert_eq!(info.delivered_path, slug.to_string_lossy());
        assert!(h.images.calls().is_empty());
        assert_eq!(h.callback.requests().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_artifact_fails_without_callback() {
        let root = TempDir::new().unwrap();
        let upstream = root.path().join("acme/api.git");
        std::fs::create_dir_all(&upstream).unwrap();
        commit_files(&upstream, &[("requirements.txt", "flask\n")]);

        let h = harness(settings(root.path(), EMPTY_SLUG), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let err = execute(&SourceCodeBuild::new(task(&upstream)), &h.ctx, &logger)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Compile(_)));
        assert!(h.callback.requests().is_empty());
        assert_eq!(h.events.tagged("e1", "builder-exector", "failure").len(), 2);
        let info = h.store.get_version_info("0123456789abcdef", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.final_status, "failure");
    }

    #[test]
    fn test_dockerfile_image_name() {
        let name = dockerfile_image_name(
            "goodrain.me",
            "0123456789abCDEF0000",
            "https://github.com/Acme/Web-App.git",
            "20250301120000",
        )
        .unwrap();
        assert_eq!(name, "goodrain.me/cdef0000_acme_web-app:20250301120000");

        let ssh = dockerfile_image_name("r", "s", "git@gitlab.com:team/api.git", "1").unwrap();
        assert_eq!(ssh, "r/s_team_api:1");
    }

    #[test]
    fn test_url_without_org_is_validation_error() {
        let err = dockerfile_image_name("r", "s", "https://example.com/web", "1").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
