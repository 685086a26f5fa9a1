// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for cleaning up stale checkout directories.
//!
//! Executors remove their checkouts when an attempt ends, but a crash or a
//! killed process can leave them behind under
//! `{CACHE_DIR}/build/{tenant_id}/`:
//! - `<sha1(repo_url)>` - source-code build checkouts
//! - `source/<version_id>` - plugin Dockerfile checkouts
//! - `check/<sha1(repo_url)>` - service-check checkouts
//!
//! Compile caches under `cache/` are kept. A directory an executor currently
//! holds is skipped, whatever its age.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::workdir::WorkDirLocks;

/// Tenant subdirectories that hold one checkout per entry.
const CHECKOUT_GROUPS: [&str; 2] = ["source", "check"];

/// Tenant subdirectories never touched.
const KEPT: [&str; 1] = ["cache"];

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Cache directory containing `build/<tenant_id>` trees.
    pub cache_dir: PathBuf,
    /// How often to scan for stale directories.
    pub poll_interval: Duration,
    /// Minimum age of a checkout before it is removed.
    pub max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/cache"),
            poll_interval: Duration::from_secs(3600), // 1 hour
            max_age: Duration::from_secs(6 * 3600),   // 6 hours
        }
    }
}

/// Background worker that removes stale checkouts.
pub struct CleanupWorker {
    config: CleanupWorkerConfig,
    workdirs: Arc<WorkDirLocks>,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker sharing the executors' lock table.
    pub fn new(config: CleanupWorkerConfig, workdirs: Arc<WorkDirLocks>) -> Self {
        Self {
            config,
            workdirs,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup worker loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            cache_dir = %self.config.cache_dir.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_stale_directories().await {
                        error!(error = %e, "Failed to cleanup stale directories");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Scan every tenant tree once. Returns the number of removed directories.
    pub async fn cleanup_stale_directories(&self) -> std::io::Result<u64> {
        let max_age = chrono::Duration::from_std(self.config.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let build_root = self.config.cache_dir.join("build");
        let mut cleaned = 0u64;
        let mut errors = 0u64;

        let mut tenant_dirs = match tokio::fs::read_dir(&build_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Build cache directory does not exist, nothing to clean");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        while let Some(tenant_entry) = tenant_dirs.next_entry().await? {
            let tenant_path = tenant_entry.path();
            if !tenant_path.is_dir() {
                continue;
            }

            let mut entries = match tokio::fs::read_dir(&tenant_path).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %tenant_path.display(), error = %e, "Failed to read tenant directory");
                    errors += 1;
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if KEPT.contains(&name.as_ref()) || !path.is_dir() {
                    continue;
                }
                if CHECKOUT_GROUPS.contains(&name.as_ref()) {
                    let (group_cleaned, group_errors) = self.cleanup_group(&path, cutoff).await;
                    cleaned += group_cleaned;
                    errors += group_errors;
                    continue;
                }
                match self.remove_if_stale(&path, cutoff).await {
                    Ok(true) => cleaned += 1,
                    Ok(false) => {}
                    Err(()) => errors += 1,
                }
            }
        }

        if cleaned > 0 || errors > 0 {
            info!(cleaned = cleaned, errors = errors, "Cleanup cycle completed");
        } else {
            debug!("Cleanup cycle completed, no stale directories found");
        }

        Ok(cleaned)
    }

    async fn cleanup_group(&self, group: &Path, cutoff: DateTime<Utc>) -> (u64, u64) {
        let mut cleaned = 0u64;
        let mut errors = 0u64;

        let mut entries = match tokio::fs::read_dir(group).await {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %group.display(), error = %e, "Failed to read checkout group");
                return (0, 1);
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.remove_if_stale(&path, cutoff).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(()) => errors += 1,
            }
        }
        (cleaned, errors)
    }

    /// Remove `path` if it is older than `cutoff` and no executor holds it.
    async fn remove_if_stale(&self, path: &Path, cutoff: DateTime<Utc>) -> Result<bool, ()> {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Failed to get modification time");
                return Err(());
            }
        };
        if modified > cutoff {
            return Ok(false);
        }

        let Some(_guard) = self.workdirs.try_lock(path).await else {
            debug!(path = %path.display(), "Checkout in use, skipping");
            return Ok(false);
        };

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(
                    path = %path.display(),
                    age_hours = (Utc::now() - modified).num_hours(),
                    "Removed stale checkout"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove stale checkout");
                Err(())
            }
        }
    }
}
