// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `build_from_image`: pull a user image, retag it into the platform registry
//! and push it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Delivery, ServiceTarget, fail_service_build, finish_service_build};
use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::sources::{ImageName, RegistryAuth};
use crate::task::ImageBuildTask;

/// Executor of image builds.
pub struct ImageBuild {
    task: ImageBuildTask,
}

impl ImageBuild {
    /// Executor for `task`.
    pub fn new(task: ImageBuildTask) -> Self {
        Self { task }
    }

    /// `<registry>/<serviceID>:<deployVersion>`
    pub fn target_image(&self, registry: &str) -> String {
        format!("{}/{}:{}", registry, self.task.service_id, self.task.deploy_version)
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
}

#[async_trait]
impl TaskExecutor for ImageBuild {
    type Output = Delivery;

    fn name(&self) -> &'static str {
        "build_from_image"
    }

    async fn prepare(&self, _ctx: &BuildContext, _logger: &Arc<dyn Logger>) -> Result<()> {
        ImageName::parse(&self.task.image)
            .map(|_| ())
            .map_err(|e| Error::Validation(e.to_string()))
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<Delivery> {
        let timeout = ctx.settings.image_timeout;
        let auth = RegistryAuth::from_parts(self.task.user.as_deref(), self.task.password.as_deref());
        let target = self.target_image(&ctx.settings.registry_domain);

        logger.info(
            &format!("Start pull image {}", self.task.image),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        ctx.images
            .pull(&self.task.image, auth.as_ref(), logger.as_ref(), timeout)
            .await?;
        ctx.images.tag(&self.task.image, &target).await?;
        ctx.images.push(&target, None, logger.as_ref(), timeout).await?;
        info!(source = %self.task.image, image = %target, "Image retagged into registry");

        Ok(Delivery::image(target))
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, delivery: Delivery) -> Result<()> {
        finish_service_build(ctx, logger.as_ref(), &self.target(), &delivery).await
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        fail_service_build(ctx, &self.target(), "image", &error.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::harness;
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::config::BuildSettings;
    use crate::dispatcher::execute;
    use crate::event::EventLogManager;
    use crate::sources::{ImageCall, MockImageClient};

    fn task() -> ImageBuildTask {
        ImageBuildTask {
            event_id: "e1".into(),
            tenant_id: "t1".into(),
            tenant_name: "acme".into(),
            service_id: "s1".into(),
            service_alias: "web".into(),
            deploy_version: "20250301120000".into(),
            image: "nginx:1.25".into(),
            user: Some("bob".into()),
            password: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn test_pull_tag_push() {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        execute(&ImageBuild::new(task()), &h.ctx, &logger).await.unwrap();

        let target = format!("{}/s1:20250301120000", h.ctx.settings.registry_domain);
        assert_eq!(
            h.images.calls(),
            vec![
                ImageCall::Pull {
                    image: "nginx:1.25".into(),
                    authenticated: true
                },
                ImageCall::Tag {
                    source: "nginx:1.25".into(),
                    target: target.clone()
                },
                ImageCall::Push {
                    image: target.clone(),
                    authenticated: false
                },
            ]
        );
        let info = h.store.get_version_info("s1", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.image_name.as_deref(), Some(target.as_str()));
        assert_eq!(h.callback.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_image_fails_without_callback() {
        let h = harness(
            BuildSettings::default(),
            MockImageClient::new().with_missing_image("nginx:1.25"),
            RecordingCallback::new(),
        )
        .await;
        let logger = h.events.get_logger("e1");

        assert!(execute(&ImageBuild::new(task()), &h.ctx, &logger).await.is_err());
        assert_eq!(h.images.count("pull"), 3);
        assert_eq!(h.images.count("push"), 0);
        assert!(h.callback.requests().is_empty());
        assert_eq!(h.events.tagged("e1", "callback", "failure").len(), 1);
    }
}
