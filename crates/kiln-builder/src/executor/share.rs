// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `share-slug` and `share-image`: publish a service build to the app market.
//!
//! The outcome is recorded as the share status (`success` or `failure`) and
//! as the event's final status.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::market_slug::copy_slug;
use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::sources::RegistryAuth;
use crate::task::{ImageShareTask, SlugShareTask};
use crate::workdir;

async fn record_share(ctx: &BuildContext, event_id: &str, share_id: &str, status: &str, message: Option<&str>) -> Result<()> {
    ctx.store.update_share_status(share_id, status).await?;
    if let Err(e) = ctx.store.finish_service_event(event_id, status, message).await {
        warn!(event_id, error = %e, "Failed to finish share event");
    }
    Ok(())
}

/// Copies a service slug into the share directory.
pub struct SlugShare {
    task: SlugShareTask,
}

impl SlugShare {
    /// Executor for `task`.
    pub fn new(task: SlugShareTask) -> Self {
        Self { task }
    }
}

#[async_trait]
impl TaskExecutor for SlugShare {
    type Output = String;

    fn name(&self) -> &'static str {
        "share-slug"
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<String> {
        let dest = workdir::share_slug_path(
            &ctx.settings.share_dir,
            &self.task.share_id,
            &self.task.service_key,
            &self.task.app_version,
        );
        logger.info(
            "Start sharing slug",
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        let size = copy_slug(Path::new(&self.task.local_slug_path), &dest).await?;
        info!(share_id = %self.task.share_id, dest = %dest.display(), size, "Slug shared");
        Ok(dest.to_string_lossy().into_owned())
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, path: String) -> Result<()> {
        record_share(ctx, &self.task.event_id, &self.task.share_id, "success", None).await?;
        logger.info(
            &format!("Share slug to {} success", path),
            attrs([("step", "last"), ("status", "success")]),
        );
        Ok(())
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        record_share(ctx, &self.task.event_id, &self.task.share_id, "failure", Some(&error.to_string())).await
    }
}

/// Pushes a service image to the share registry.
pub struct ImageShare {
    task: ImageShareTask,
}

impl ImageShare {
    /// Executor for `task`.
    pub fn new(task: ImageShareTask) -> Self {
        Self { task }
    }

    /// `<share_registry>/<service_key>:<app_version>`
    pub fn target_image(&self, share_registry: &str) -> String {
        format!("{}/{}:{}", share_registry, self.task.service_key, self.task.app_version)
    }
}

#[async_trait]
impl TaskExecutor for ImageShare {
    type Output = String;

    fn name(&self) -> &'static str {
        "share-image"
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<String> {
        let timeout = ctx.settings.image_timeout;
        let target = self.target_image(&ctx.settings.share_registry);
        let auth = RegistryAuth::from_parts(self.task.share_user.as_deref(), self.task.share_password.as_deref());

        logger.info(
            &format!("Start sharing image {}", self.task.image_name),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        ctx.images
            .pull(&self.task.image_name, None, logger.as_ref(), timeout)
            .await?;
        ctx.images.tag(&self.task.image_name, &target).await?;
        ctx.images.push(&target, auth.as_ref(), logger.as_ref(), timeout).await?;
        info!(share_id = %self.task.share_id, image = %target, "Image shared");
        Ok(target)
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, image: String) -> Result<()> {
        record_share(ctx, &self.task.event_id, &self.task.share_id, "success", None).await?;
        logger.info(
            &format!("Share image {} success", image),
            attrs([("step", "last"), ("status", "success")]),
        );
        Ok(())
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        record_share(ctx, &self.task.event_id, &self.task.share_id, "failure", Some(&error.to_string())).await
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
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_slug_share_copies_and_records_status() {
        let root = TempDir::new().unwrap();
        let local = root.path().join("local.tgz");
        std::fs::write(&local, b"slug").unwrap();
        let settings = BuildSettings {
            share_dir: root.path().join("share"),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let task = SlugShareTask {
            event_id: "e1".into(),
            share_id: "sh1".into(),
            service_key: "key".into(),
            app_version: "1.0".into(),
            local_slug_path: local.to_string_lossy().into_owned(),
        };

        execute(&SlugShare::new(task), &h.ctx, &logger).await.unwrap();

        assert!(workdir::share_slug_path(&root.path().join("share"), "sh1", "key", "1.0").is_file());
        assert_eq!(h.store.get_share_status("sh1").await.unwrap().as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_missing_slug_records_failure() {
        let root = TempDir::new().unwrap();
        let settings = BuildSettings {
            share_dir: root.path().join("share"),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let task = SlugShareTask {
            event_id: "e1".into(),
            share_id: "sh1".into(),
            service_key: "key".into(),
            app_version: "1.0".into(),
            local_slug_path: root.path().join("missing.tgz").to_string_lossy().into_owned(),
        };

        assert!(execute(&SlugShare::new(task), &h.ctx, &logger).await.is_err());
        assert_eq!(h.store.get_share_status("sh1").await.unwrap().as_deref(), Some("failure"));
    }

    #[tokio::test]
    async fn test_image_share_pushes_with_share_credentials() {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let task = ImageShareTask {
            event_id: "e1".into(),
            share_id: "sh2".into(),
            service_key: "key".into(),
            app_version: "1.0".into(),
            image_name: "goodrain.me/s1:20250301120000".into(),
            share_user: Some("market".into()),
            share_password: Some("secret".into()),
        };

        execute(&ImageShare::new(task), &h.ctx, &logger).await.unwrap();

        assert_eq!(
            h.images.calls()[2],
            ImageCall::Push {
                image: "hub.goodrain.com/kiln/key:1.0".into(),
                authenticated: true
            }
        );
        assert_eq!(h.store.get_share_status("sh2").await.unwrap().as_deref(), Some("success"));
    }
}
