// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `build_from_market_slug`: install a slug published in the app market as
//! the service's build output.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Delivery, ServiceTarget, fail_service_build, finish_service_build};
use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::slug::verify_artifact;
use crate::task::MarketSlugTask;
use crate::workdir;

/// Executor of market slug installs.
pub struct MarketSlugInstall {
    task: MarketSlugTask,
}

impl MarketSlugInstall {
    /// Executor for `task`.
    pub fn new(task: MarketSlugTask) -> Self {
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
}

/// Copy `source` to `dest`, creating parent directories, and check the copy
/// is not empty. Returns the copied size.
pub(crate) async fn copy_slug(source: &Path, dest: &Path) -> Result<u64> {
    verify_artifact(source).await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, dest).await?;
    verify_artifact(dest).await
}

#[async_trait]
impl TaskExecutor for MarketSlugInstall {
    type Output = Delivery;

    fn name(&self) -> &'static str {
        "build_from_market_slug"
    }

    async fn prepare(&self, _ctx: &BuildContext, _logger: &Arc<dyn Logger>) -> Result<()> {
        if self.task.slug_path.is_empty() {
            return Err(Error::Validation("slug_path is required".to_string()));
        }
        Ok(())
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<Delivery> {
        let dest = workdir::slug_path(
            &ctx.settings.data_dir,
            &self.task.tenant_id,
            &self.task.service_id,
            &self.task.deploy_version,
        );
        logger.info(
            "Start installing slug from app market",
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        let size = copy_slug(Path::new(&self.task.slug_path), &dest).await?;
        info!(source = %self.task.slug_path, dest = %dest.display(), size, "Market slug installed");
        Ok(Delivery::slug(dest.to_string_lossy()))
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, delivery: Delivery) -> Result<()> {
        finish_service_build(ctx, logger.as_ref(), &self.target(), &delivery).await
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        fail_service_build(ctx, &self.target(), "slug", &error.to_string()).await
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
    use crate::sources::MockImageClient;
    use tempfile::TempDir;

    fn task(slug_path: &Path) -> MarketSlugTask {
        MarketSlugTask {
            event_id: "e1".into(),
            tenant_id: "t1".into(),
            tenant_name: "acme".into(),
            service_id: "s1".into(),
            service_alias: "web".into(),
            deploy_version: "20250301120000".into(),
            slug_path: slug_path.to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn test_installs_slug() {
        let root = TempDir::new().unwrap();
        let market = root.path().join("market.tgz");
        std::fs::write(&market, b"slug").unwrap();
        let settings = BuildSettings {
            data_dir: root.path().join("data"),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        execute(&MarketSlugInstall::new(task(&market)), &h.ctx, &logger).await.unwrap();

        let dest = workdir::slug_path(&root.path().join("data"), "t1", "s1", "20250301120000");
        assert_eq!(std::fs::read(&dest).unwrap(), b"slug");
        let info = h.store.get_version_info("s1", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.delivered_type, "slug");
        assert_eq!(h.callback.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_market_slug_fails() {
        let root = TempDir::new().unwrap();
        let market = root.path().join("market.tgz");
        std::fs::write(&market, b"").unwrap();
        let settings = BuildSettings {
            data_dir: root.path().join("data"),
            ..Default::default()
        };
        let h = harness(settings, MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        assert!(execute(&MarketSlugInstall::new(task(&market)), &h.ctx, &logger).await.is_err());
        assert!(h.callback.requests().is_empty());
        let info = h.store.get_version_info("s1", "20250301120000").await.unwrap().unwrap();
        assert_eq!(info.final_status, "failure");
    }
}
