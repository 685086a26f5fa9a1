// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `service_check`: inspect a service source before it is created.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BuildSettings;
use crate::context::BuildContext;
use crate::dispatcher::{RetryPolicy, TaskExecutor};
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::parser::{CheckResult, ParseError, ServiceInfo, docker_compose, docker_run, source_code};
use crate::sources::RegistryAuth;
use crate::task::ServiceCheckTask;

/// Check outcome as written to the event log.
#[derive(Debug, Serialize)]
pub struct CheckReport<'a> {
    /// Caller's check ID.
    pub check_uuid: &'a str,
    /// `success` or `failure`.
    pub check_status: &'static str,
    /// Every error found.
    pub error_infos: &'a [ParseError],
    /// Services found.
    pub service_info: &'a [ServiceInfo],
}

/// Executor of service checks.
pub struct ServiceCheck {
    task: ServiceCheckTask,
}

impl ServiceCheck {
    /// Executor for `task`.
    pub fn new(task: ServiceCheckTask) -> Self {
        Self { task }
    }
}

#[async_trait]
impl TaskExecutor for ServiceCheck {
    type Output = CheckResult;

    fn name(&self) -> &'static str {
        "service_check"
    }

    fn retry_policy(&self, _settings: &BuildSettings) -> RetryPolicy {
        RetryPolicy::once()
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<CheckResult> {
        logger.info(
            &format!("Start checking {} source", self.task.source_type),
            attrs([("step", "builder-exector"), ("status", "starting")]),
        );
        let result = match self.task.source_type.as_str() {
            "docker-run" => {
                let auth = RegistryAuth::from_parts(self.task.username.as_deref(), self.task.password.as_deref());
                docker_run::check(
                    &self.task.source_body,
                    auth.as_ref(),
                    ctx.images.as_ref(),
                    logger.as_ref(),
                    ctx.settings.image_timeout,
                )
                .await
            }
            "docker-compose" => docker_compose::check(&self.task.source_body),
            "sourcecode" => {
                source_code::check(
                    &self.task.source_body,
                    &self.task.tenant_id,
                    &ctx.settings,
                    &ctx.workdirs,
                    logger.clone(),
                )
                .await
            }
            other => CheckResult::fatal(
                format!("source type {} is not supported", other),
                "use docker-run, docker-compose or sourcecode",
            ),
        };
        Ok(result)
    }

    async fn on_success(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, result: CheckResult) -> Result<()> {
        let status = result.status();
        let report = CheckReport {
            check_uuid: &self.task.check_uuid,
            check_status: status,
            error_infos: &result.errors,
            service_info: &result.services,
        };
        logger.info(&serde_json::to_string(&report)?, attrs([("step", "last"), ("status", status)]));
        info!(
            check_uuid = %self.task.check_uuid,
            status,
            errors = result.errors.len(),
            "Service check finished"
        );

        ctx.store
            .finish_service_event(&self.task.event_id, status, None)
            .await?;
        Ok(())
    }

    async fn on_failure(&self, ctx: &BuildContext, _logger: &Arc<dyn Logger>, error: &Error) -> Result<()> {
        if let Err(e) = ctx
            .store
            .finish_service_event(&self.task.event_id, "failure", Some(&error.to_string()))
            .await
        {
            warn!(event_id = %self.task.event_id, error = %e, "Failed to finish service check event");
        }
        Ok(())
    }
}
