// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source repository check.
//!
//! Clones the repository into a scratch checkout, detects the language and,
//! for Dockerfile projects, reads the Dockerfile's declarations. The scratch
//! checkout is removed once the check finishes.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use super::dockerfile::parse_dockerfile;
use super::lang::{self, Lang};
use super::{CheckResult, Env, ParseError, Port, ServiceInfo, Volume};
use crate::config::BuildSettings;
use crate::event::Logger;
use crate::sources::{CloneOptions, CodeSource, clone_repository};
use crate::workdir::{WorkDirLocks, check_dir};

/// Optional per-repository convention file.
const CONVENTION_FILE: &str = "rainbondfile";

/// `source_body` of a `sourcecode` check.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceCodeBody {
    /// Repository URL.
    pub repository_url: String,
    /// Branch to check.
    #[serde(default)]
    pub branch: Option<String>,
    /// Basic-auth user.
    #[serde(default)]
    pub user: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Tenant the scratch checkout belongs to.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Check the repository described by `source_body` (JSON).
pub async fn check(
    source_body: &str,
    tenant_id: &str,
    settings: &BuildSettings,
    workdirs: &WorkDirLocks,
    logger: Arc<dyn Logger>,
) -> CheckResult {
    let body: SourceCodeBody = match serde_json::from_str(source_body) {
        Ok(body) => body,
        Err(e) => {
            return CheckResult::fatal(
                format!("source code descriptor is invalid: {}", e),
                "check the repository address and credentials",
            );
        }
    };
    if body.repository_url.trim().is_empty() {
        return CheckResult::fatal("repository url can not be empty", "provide the repository address");
    }

    let tenant = body
        .tenant_id
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(tenant_id);
    let target = check_dir(&settings.cache_dir, tenant, &body.repository_url);
    let _guard = workdirs.lock(&target).await;

    let source = CodeSource {
        repo_url: body.repository_url.clone(),
        branch: body
            .branch
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "master".to_string()),
        user: body.user.clone(),
        password: body.password.clone(),
    };
    let options = CloneOptions {
        timeout: settings.clone_timeout,
        ssh_dir: settings.ssh_dir.clone(),
        github_proxy: settings.github_proxy.clone(),
    };

    let result = match clone_repository(&source, &target, &options, logger).await {
        Ok(repository) => inspect_checkout(&target, repository.branches).await,
        Err(e) => CheckResult::fatal(e.to_string(), e.solve_advice()),
    };

    if let Err(e) = tokio::fs::remove_dir_all(&target).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %target.display(), error = %e, "Failed to remove check checkout");
    }
    result
}

async fn inspect_checkout(dir: &Path, branches: Vec<String>) -> CheckResult {
    let mut result = CheckResult::default();

    if !dir.join(CONVENTION_FILE).is_file() {
        result.errors.push(ParseError::negligible(
            "rainbondfile not found",
            "add a rainbondfile to declare ports and environment",
        ));
    }

    let Some(language) = lang::detect(dir) else {
        result.errors.push(ParseError::fatal(
            "the language of the code could not be recognised",
            "check that the repository contains a supported project",
        ));
        return result;
    };
    debug!(dir = %dir.display(), language = %language, "Detected source language");

    let mut service = ServiceInfo {
        branches,
        language: Some(language.to_string()),
        memory: language.recommended_memory(),
        ..Default::default()
    };

    if language == Lang::Dockerfile {
        let content = match tokio::fs::read_to_string(dir.join("Dockerfile")).await {
            Ok(content) => content,
            Err(e) => {
                result
                    .errors
                    .push(ParseError::fatal(format!("Dockerfile could not be read: {}", e), "check the Dockerfile"));
                return result;
            }
        };
        match parse_dockerfile(&content) {
            Ok(info) => {
                service.envs = info
                    .envs
                    .into_iter()
                    .map(|(name, value)| Env { name, value })
                    .collect();
                service.ports = info.ports.into_values().collect::<Vec<Port>>();
                service.volumes = info.volumes.into_iter().map(Volume::share_file).collect();
            }
            Err(e) => {
                result
                    .errors
                    .push(ParseError::fatal(format!("Dockerfile is invalid: {}", e), "check the Dockerfile"));
                return result;
            }
        }
    }

    result.services.push(service);
    result
}
