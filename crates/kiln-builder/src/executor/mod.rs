// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task executors.
//!
//! | Task type | Executor |
//! |-----------|----------|
//! | `build_from_source_code` | [`source_code::SourceCodeBuild`] |
//! | `build_from_image` | [`image::ImageBuild`] |
//! | `build_from_market_slug` | [`market_slug::MarketSlugInstall`] |
//! | `plugin_image_build`, `plugin_dockerfile_build` | [`plugin::PluginBuild`] |
//! | `service_check` | [`service_check::ServiceCheck`] |
//! | `share-slug`, `share-image` | [`share::SlugShare`], [`share::ImageShare`] |
//! | `app_image`, `app_slug`, `image_manual`, `code_check`, `app_build` | [`script::ScriptRun`] |
//!
//! Service builds share one finalisation: on success the version info, the
//! service deploy version and the event are written before the upgrade
//! callback fires; on terminal failure the event fails and the deploy version
//! reverts to the one recorded on the event.

pub mod image;
pub mod market_slug;
pub mod plugin;
pub mod script;
pub mod service_check;
pub mod share;
pub mod source_code;

use std::sync::Arc;

use chrono::Utc;
use kiln_core::persistence::VersionInfoRecord;
use tracing::{debug, warn};

use crate::callback::UpgradeRequest;
use crate::context::BuildContext;
use crate::dispatcher::execute;
use crate::error::Result;
use crate::event::{Logger, attrs};
use crate::sources::CommitInfo;
use crate::task::BuildTask;

/// Run a decoded task with the matching executor.
pub async fn run(task: BuildTask, ctx: &BuildContext, logger: &Arc<dyn Logger>) -> Result<()> {
    match task {
        BuildTask::SourceCode(t) => execute(&source_code::SourceCodeBuild::new(t), ctx, logger).await,
        BuildTask::Image(t) => execute(&image::ImageBuild::new(t), ctx, logger).await,
        BuildTask::MarketSlug(t) => execute(&market_slug::MarketSlugInstall::new(t), ctx, logger).await,
        BuildTask::PluginImage(t) => execute(&plugin::PluginBuild::from_image(t), ctx, logger).await,
        BuildTask::PluginDockerfile(t) => execute(&plugin::PluginBuild::from_dockerfile(t), ctx, logger).await,
        BuildTask::ServiceCheck(t) => execute(&service_check::ServiceCheck::new(t), ctx, logger).await,
        BuildTask::ShareSlug(t) => execute(&share::SlugShare::new(t), ctx, logger).await,
        BuildTask::ShareImage(t) => execute(&share::ImageShare::new(t), ctx, logger).await,
        BuildTask::Script(t) => execute(&script::ScriptRun::new(t), ctx, logger).await,
    }
}

/// Work done once when a task is admitted, before it waits for a pool slot.
///
/// Plugin builds register their version as `building` here; other tasks
/// have nothing to record.
pub async fn admit(task: &BuildTask, ctx: &BuildContext, logger: &dyn Logger) -> Result<()> {
    match task {
        BuildTask::PluginImage(t) => plugin::PluginBuild::from_image(t.clone()).register(ctx, logger).await,
        BuildTask::PluginDockerfile(t) => plugin::PluginBuild::from_dockerfile(t.clone()).register(ctx, logger).await,
        _ => Ok(()),
    }
}

/// The service a build belongs to.
#[derive(Debug, Clone, Default)]
pub struct ServiceTarget {
    /// Correlation ID.
    pub event_id: String,
    /// Tenant ID.
    pub tenant_id: String,
    /// Tenant name used in the upgrade callback.
    pub tenant_name: String,
    /// Service ID.
    pub service_id: String,
    /// Service alias used in the upgrade callback.
    pub service_alias: String,
    /// Deploy version being built.
    pub deploy_version: String,
}

/// What a service build delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// `slug` or `image`.
    pub delivered_type: &'static str,
    /// Slug path or image reference.
    pub delivered_path: String,
    /// Built image, for image deliveries.
    pub image_name: Option<String>,
    /// Source repository.
    pub repo_url: Option<String>,
    /// Commit the delivery was built from.
    pub commit: Option<CommitInfo>,
}

impl Delivery {
    /// An image delivery.
    pub fn image(image: impl Into<String>) -> Self {
        let image = image.into();
        Self {
            delivered_type: "image",
            delivered_path: image.clone(),
            image_name: Some(image),
            repo_url: None,
            commit: None,
        }
    }

    /// A slug delivery.
    pub fn slug(path: impl Into<String>) -> Self {
        Self {
            delivered_type: "slug",
            delivered_path: path.into(),
            image_name: None,
            repo_url: None,
            commit: None,
        }
    }

    fn version_info(&self, target: &ServiceTarget, final_status: &str) -> VersionInfoRecord {
        VersionInfoRecord {
            service_id: target.service_id.clone(),
            build_version: target.deploy_version.clone(),
            event_id: target.event_id.clone(),
            delivered_type: self.delivered_type.to_string(),
            delivered_path: self.delivered_path.clone(),
            image_name: self.image_name.clone(),
            repo_url: self.repo_url.clone(),
            code_version: self.commit.as_ref().map(|c| c.hash.clone()),
            commit_msg: self.commit.as_ref().map(|c| c.message.clone()),
            author: self.commit.as_ref().map(|c| c.author.clone()),
            final_status: final_status.to_string(),
            finish_time: Some(Utc::now()),
        }
    }
}

/// Record a successful service build and ask for the upgrade.
///
/// Store failures propagate. A rejected callback is logged and swallowed.
pub async fn finish_service_build(
    ctx: &BuildContext,
    logger: &dyn Logger,
    target: &ServiceTarget,
    delivery: &Delivery,
) -> Result<()> {
    ctx.store
        .upsert_version_info(&delivery.version_info(target, "success"))
        .await?;
    ctx.store
        .set_service_deploy_version(&target.service_id, &target.deploy_version)
        .await?;
    ctx.store
        .finish_service_event(&target.event_id, "success", None)
        .await?;
    logger.info("Build success", attrs([("step", "last"), ("status", "success")]));

    let request = UpgradeRequest {
        tenant_name: target.tenant_name.clone(),
        service_alias: target.service_alias.clone(),
        deploy_version: target.deploy_version.clone(),
        event_id: target.event_id.clone(),
    };
    if let Err(e) = ctx.callback.trigger_upgrade(&request).await {
        warn!(service_id = %target.service_id, error = %e, "Upgrade callback failed");
        logger.error(
            &format!("Upgrade service failure: {}", e),
            attrs([("step", "callback"), ("status", "failure")]),
        );
    }
    Ok(())
}

/// Record a terminal service build failure.
pub async fn fail_service_build(
    ctx: &BuildContext,
    target: &ServiceTarget,
    delivered_type: &'static str,
    message: &str,
) -> Result<()> {
    let mut info = Delivery {
        delivered_type,
        delivered_path: String::new(),
        image_name: None,
        repo_url: None,
        commit: None,
    }
    .version_info(target, "failure");
    if let Some(existing) = ctx
        .store
        .get_version_info(&target.service_id, &target.deploy_version)
        .await?
    {
        info = VersionInfoRecord {
            final_status: "failure".to_string(),
            finish_time: Some(Utc::now()),
            ..existing
        };
    }
    ctx.store.upsert_version_info(&info).await?;

    ctx.store
        .finish_service_event(&target.event_id, "failure", Some(message))
        .await?;
    revert_deploy_version(ctx, target).await
}

async fn revert_deploy_version(ctx: &BuildContext, target: &ServiceTarget) -> Result<()> {
    let event = match ctx.store.get_service_event(&target.event_id).await {
        Ok(event) => event,
        Err(e) if e.is_not_found() => {
            debug!(event_id = %target.event_id, "No service event, deploy version left as is");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if !event.old_deploy_version.is_empty() {
        ctx.store
            .set_service_deploy_version(&target.service_id, &event.old_deploy_version)
            .await?;
        debug!(
            service_id = %target.service_id,
            deploy_version = %event.old_deploy_version,
            "Deploy version reverted"
        );
    }
    Ok(())
}
