// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for kiln-builder.

use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::RetryPolicy;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://` or `sqlite:` URL of the build store.
    pub database_url: String,
    /// Redis URL of the task queue.
    pub redis_url: String,
    /// Redis list the builder pops tasks from.
    pub task_queue: String,
    /// Base URL of the API the upgrade callback is sent to.
    pub api_url: String,
    /// Token sent as `Authorization: Token <token>` on callbacks.
    pub api_token: Option<String>,
    /// Pipeline settings shared by every executor.
    pub build: BuildSettings,
}

/// Settings that shape how tasks are executed.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Registry every built image is pushed to.
    pub registry_domain: String,
    /// Root of checkouts and compile caches.
    pub cache_dir: PathBuf,
    /// Root of slug output.
    pub data_dir: PathBuf,
    /// External compile script for the slug path.
    pub build_script: PathBuf,
    /// Directory holding legacy task scripts.
    pub plugin_dir: PathBuf,
    /// Interpreter the legacy scripts are run with.
    pub script_interpreter: String,
    /// Root slugs are shared into.
    pub share_dir: PathBuf,
    /// Registry images are shared into.
    pub share_registry: String,
    /// Proxy used for clones from github.com.
    pub github_proxy: Option<String>,
    /// Directory holding `builder_rsa` / `id_rsa`.
    pub ssh_dir: PathBuf,
    /// Maximum number of tasks executing at once.
    pub max_concurrent_tasks: usize,
    /// Attempts and delay for artifact-producing tasks.
    pub retry: RetryPolicy,
    /// Deadline after which a plugin build still `building` is flagged.
    pub building_timeout: Duration,
    /// Deadline for events whose operation type starts with `build`.
    pub build_event_timeout: Duration,
    /// Deadline for every other event.
    pub event_timeout: Duration,
    /// Per-attempt timeout of git clones.
    pub clone_timeout: Duration,
    /// Per-operation timeout of image pull/tag/push/build.
    pub image_timeout: Duration,
    /// Per-attempt timeout of the compile script.
    pub compile_timeout: Duration,
    /// Per-attempt timeout of legacy scripts.
    pub script_timeout: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            registry_domain: "goodrain.me".to_string(),
            cache_dir: PathBuf::from("/cache"),
            data_dir: PathBuf::from("/grdata"),
            build_script: PathBuf::from("/usr/local/bin/kiln-slug-build"),
            plugin_dir: PathBuf::from("plugins"),
            script_interpreter: "python".to_string(),
            share_dir: PathBuf::from("/grdata/build/share"),
            share_registry: "hub.goodrain.com/kiln".to_string(),
            github_proxy: None,
            ssh_dir: default_ssh_dir(),
            max_concurrent_tasks: default_concurrency(),
            retry: RetryPolicy::default(),
            building_timeout: Duration::from_secs(180),
            build_event_timeout: Duration::from_secs(180),
            event_timeout: Duration::from_secs(30),
            clone_timeout: Duration::from_secs(5 * 60),
            image_timeout: Duration::from_secs(20 * 60),
            compile_timeout: Duration::from_secs(60 * 60),
            script_timeout: Duration::from_secs(30 * 60),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

fn default_ssh_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".ssh"))
        .unwrap_or_else(|_| PathBuf::from("/root/.ssh"))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KILN_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("KILN_DATABASE_URL"))?;

        let redis_url = std::env::var("KILN_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let task_queue =
            std::env::var("KILN_TASK_QUEUE").unwrap_or_else(|_| "kiln:builder:tasks".to_string());
        let api_url =
            std::env::var("KILN_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8888".to_string());
        let api_token = std::env::var("KILN_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let defaults = BuildSettings::default();

        let max_concurrent_tasks = match std::env::var("KILN_MAX_CONCURRENT_TASKS") {
            Ok(v) => v
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidNumber("KILN_MAX_CONCURRENT_TASKS"))?,
            Err(_) => defaults.max_concurrent_tasks,
        };

        let build = BuildSettings {
            registry_domain: std::env::var("REGISTRYDOMAIN").unwrap_or(defaults.registry_domain),
            cache_dir: env_path("CACHE_DIR").unwrap_or(defaults.cache_dir),
            data_dir: env_path("KILN_DATA_DIR").unwrap_or(defaults.data_dir),
            build_script: env_path("KILN_BUILD_SCRIPT").unwrap_or(defaults.build_script),
            plugin_dir: env_path("KILN_PLUGIN_DIR").unwrap_or(defaults.plugin_dir),
            share_dir: env_path("KILN_SHARE_DIR").unwrap_or(defaults.share_dir),
            share_registry: std::env::var("KILN_SHARE_REGISTRY")
                .unwrap_or(defaults.share_registry),
            github_proxy: std::env::var("GITHUB_PROXY").ok().filter(|p| !p.is_empty()),
            max_concurrent_tasks,
            ..defaults
        };

        Ok(Self {
            database_url,
            redis_url,
            task_queue,
            api_url,
            api_token,
            build,
        })
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable could not be parsed or is zero.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
}
