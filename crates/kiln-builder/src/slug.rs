// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source-to-slug compilation through the external build script.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::event::Logger;
use crate::process::run_streaming;

/// Arguments of one build script invocation.
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Branch being built.
    pub branch: String,
    /// Checkout directory.
    pub source_dir: PathBuf,
    /// Compile cache directory.
    pub cache_dir: PathBuf,
    /// Directory the slug is written into.
    pub output_dir: PathBuf,
    /// Deploy version; the slug is `<output_dir>/<deploy_version>.tgz`.
    pub deploy_version: String,
    /// Log file the script writes.
    pub log_file: PathBuf,
    /// Tenant ID.
    pub tenant_id: String,
    /// Service ID.
    pub service_id: String,
    /// Language runtime version.
    pub runtime: String,
    /// Detected language.
    pub lang: String,
    /// Build name.
    pub build_name: String,
    /// Build environment passed with `-e`.
    pub envs: BTreeMap<String, String>,
}

impl CompileRequest {
    /// `K=V` pairs joined by `:::`.
    pub fn env_string(&self) -> String {
        self.envs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(":::")
    }

    /// Command line arguments of the build script.
    pub fn args(&self) -> Vec<String> {
        let path = |p: &Path| p.to_string_lossy().into_owned();
        let mut args = vec![
            "-b".to_string(),
            self.branch.clone(),
            "-s".to_string(),
            path(&self.source_dir),
            "-c".to_string(),
            path(&self.cache_dir),
            "-d".to_string(),
            path(&self.output_dir),
            "-v".to_string(),
            self.deploy_version.clone(),
            "-l".to_string(),
            path(&self.log_file),
            "-tid".to_string(),
            self.tenant_id.clone(),
            "-sid".to_string(),
            self.service_id.clone(),
            "-r".to_string(),
            self.runtime.clone(),
            "-g".to_string(),
            self.lang.clone(),
            "--name".to_string(),
            self.build_name.clone(),
        ];
        if !self.envs.is_empty() {
            args.push("-e".to_string());
            args.push(self.env_string());
        }
        args
    }

    /// Where the script is expected to leave the slug.
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.tgz", self.deploy_version))
    }
}

/// Run the build script for `request`, streaming its output into `logger`.
pub async fn run_build_script(
    script: &Path,
    request: &CompileRequest,
    logger: &dyn Logger,
    timeout: Duration,
) -> Result<()> {
    tokio::fs::create_dir_all(&request.output_dir).await?;
    tokio::fs::create_dir_all(&request.cache_dir).await?;

    let mut command = Command::new(script);
    command.args(request.args());

    let output = run_streaming(&mut command, None, Some(logger), timeout)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Compile(format!(
                "build script did not finish within {}s",
                timeout.as_secs()
            )),
            _ => Error::Compile(format!("cannot run {}: {}", script.display(), e)),
        })?;

    if !output.status.success() {
        warn!(
            service_id = %request.service_id,
            exit_code = ?output.status.code(),
            "Build script failed"
        );
        return Err(Error::Compile(format!(
            "build script exited with {:?}: {}",
            output.status.code(),
            output.tail
        )));
    }

    info!(service_id = %request.service_id, deploy_version = %request.deploy_version, "Build script finished");
    Ok(())
}

/// Check that the artifact at `path` exists and is not empty. Returns its size.
pub async fn verify_artifact(path: &Path) -> Result<u64> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Compile(format!(
                "artifact {} was not produced",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(Error::Compile(format!("artifact {} is empty", path.display())));
    }
    Ok(metadata.len())
}
