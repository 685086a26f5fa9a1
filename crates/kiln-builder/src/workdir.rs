// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Working directory layout and per-directory locking.
//!
//! ```text
//! <cache_dir>/build/<tenant_id>/<sha1(repo_url)>           source checkout
//! <cache_dir>/build/<tenant_id>/source/<version_id>        plugin Dockerfile checkout
//! <cache_dir>/build/<tenant_id>/check/<sha1(repo_url)>     service-check checkout
//! <cache_dir>/build/<tenant_id>/cache/<service_id>         compile cache
//! <data_dir>/build/tenant/<tenant_id>/slug/<service_id>/   slug output
//! ```
//!
//! Checkout directories are deterministic, so two tasks for the same tenant
//! and repository resolve to the same path. [`WorkDirLocks`] serialises them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hex SHA-1 of a repository URL.
pub fn repo_hash(repo_url: &str) -> String {
    hex::encode(Sha1::digest(repo_url.as_bytes()))
}

fn tenant_build_dir(cache_dir: &Path, tenant_id: &str) -> PathBuf {
    cache_dir.join("build").join(tenant_id)
}

/// Checkout directory of a source-code build.
pub fn source_dir(cache_dir: &Path, tenant_id: &str, repo_url: &str) -> PathBuf {
    tenant_build_dir(cache_dir, tenant_id).join(repo_hash(repo_url))
}

/// Checkout directory of a plugin Dockerfile build.
pub fn plugin_source_dir(cache_dir: &Path, tenant_id: &str, version_id: &str) -> PathBuf {
    tenant_build_dir(cache_dir, tenant_id)
        .join("source")
        .join(version_id)
}

/// Checkout directory of a source-code service check.
pub fn check_dir(cache_dir: &Path, tenant_id: &str, repo_url: &str) -> PathBuf {
    tenant_build_dir(cache_dir, tenant_id)
        .join("check")
        .join(repo_hash(repo_url))
}

/// Compile cache of a service.
pub fn compile_cache_dir(cache_dir: &Path, tenant_id: &str, service_id: &str) -> PathBuf {
    tenant_build_dir(cache_dir, tenant_id)
        .join("cache")
        .join(service_id)
}

/// Slug output directory of a service.
pub fn slug_dir(data_dir: &Path, tenant_id: &str, service_id: &str) -> PathBuf {
    data_dir
        .join("build")
        .join("tenant")
        .join(tenant_id)
        .join("slug")
        .join(service_id)
}

/// Slug artifact of one deploy version.
pub fn slug_path(data_dir: &Path, tenant_id: &str, service_id: &str, deploy_version: &str) -> PathBuf {
    slug_dir(data_dir, tenant_id, service_id).join(format!("{}.tgz", deploy_version))
}

/// Destination of a shared slug.
pub fn share_slug_path(share_dir: &Path, share_id: &str, service_key: &str, app_version: &str) -> PathBuf {
    share_dir
        .join(share_id)
        .join(service_key)
        .join(format!("{}.tgz", app_version))
}

/// Exclusive access to working directories, keyed by path.
#[derive(Default)]
pub struct WorkDirLocks {
    inflight: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorkDirLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `dir`. Released when the guard drops.
    pub async fn lock(&self, dir: &Path) -> OwnedMutexGuard<()> {
        let lock = self.entry(dir).await;
        lock.lock_owned().await
    }

    /// Exclusive use of `dir` if nobody holds it.
    pub async fn try_lock(&self, dir: &Path) -> Option<OwnedMutexGuard<()>> {
        let lock = self.entry(dir).await;
        lock.try_lock_owned().ok()
    }

    /// Number of directories currently tracked.
    pub async fn tracked(&self) -> usize {
        self.inflight.lock().await.len()
    }

    async fn entry(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        // Entries only the table references are idle.
        inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        inflight
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
