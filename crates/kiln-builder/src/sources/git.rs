// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git source fetcher.
//!
//! Clones a repository at a branch (or tag) into a target directory and
//! classifies failures into the categories users can act on. The checkout is
//! built in a staging directory and moved into place whole; on any failure
//! the target is removed, so no partial checkout is left behind.
//!
//! Transport rules:
//! - SSH authenticates with `<ssh_dir>/builder_rsa`, falling back to
//!   `<ssh_dir>/id_rsa`. Host keys are not verified.
//! - HTTP(S) uses optional basic-auth credentials. A configured proxy is only
//!   applied to `github.com` repositories.
//! - Local paths are cloned directly (mirrors and tests).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, CertificateCheckStatus, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions,
    ProxyOptions, RemoteCallbacks, Repository,
};
use tracing::{debug, warn};

use crate::event::{Logger, attrs};

/// Clones never get less time than this.
pub const MIN_CLONE_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time given to the blocking clone before it is abandoned.
const CLONE_GRACE: Duration = Duration::from_secs(10);

/// What to clone.
#[derive(Debug, Clone, Default)]
pub struct CodeSource {
    /// Repository URL or local path.
    pub repo_url: String,
    /// Branch or tag. Empty means the remote's default branch.
    pub branch: String,
    /// Basic-auth user (HTTP only).
    pub user: Option<String>,
    /// Basic-auth password (HTTP only).
    pub password: Option<String>,
}

/// How to clone.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Upper bound for the whole clone, raised to [`MIN_CLONE_TIMEOUT`].
    pub timeout: Duration,
    /// Directory holding the SSH keys.
    pub ssh_dir: PathBuf,
    /// Proxy for github.com repositories.
    pub github_proxy: Option<String>,
}

/// Last commit of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Full commit hash.
    pub hash: String,
    /// Author name.
    pub author: String,
    /// First line of the commit message.
    pub message: String,
}

impl CommitInfo {
    /// Seven-character abbreviated hash.
    pub fn short_hash(&self) -> &str {
        self.hash.get(..7).unwrap_or(&self.hash)
    }
}

/// A successful checkout.
#[derive(Debug, Clone)]
pub struct ClonedRepository {
    /// Checkout directory.
    pub path: PathBuf,
    /// Commit checked out.
    pub head: CommitInfo,
    /// Branches present on the remote.
    pub branches: Vec<String>,
}

/// Classified clone failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The remote asked for credentials and none were available.
    #[error("repository requires authentication")]
    AuthenticationRequired,
    /// The remote rejected the supplied credentials.
    #[error("repository rejected the supplied credentials")]
    AuthorizationFailed,
    /// The repository does not exist.
    #[error("repository not found")]
    RepositoryNotFound,
    /// The repository has no commits.
    #[error("remote repository is empty")]
    EmptyRemoteRepository,
    /// The requested branch or tag does not exist.
    #[error("reference '{reference}' not found")]
    ReferenceNotFound {
        /// Requested branch or tag.
        reference: String,
    },
    /// The remote did not accept the builder's SSH key.
    #[error("remote did not accept the builder ssh key")]
    SshKeyMissing,
    /// The clone did not finish in time.
    #[error("clone did not finish within {}s", .0.as_secs())]
    DeadlineExceeded(Duration),
    /// Any other git failure.
    #[error("git error: {0}")]
    Git(String),
}

impl SourceError {
    /// Stable category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authentication-required",
            Self::AuthorizationFailed => "authorization-failed",
            Self::RepositoryNotFound => "repository-not-found",
            Self::EmptyRemoteRepository => "empty-remote-repository",
            Self::ReferenceNotFound { .. } => "reference-not-found",
            Self::SshKeyMissing => "ssh-key-missing",
            Self::DeadlineExceeded(_) => "deadline-exceeded",
            Self::Git(_) => "git-error",
        }
    }

    /// What the user can do about it.
    pub fn solve_advice(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "provide repository credentials or configure the builder key",
            Self::AuthorizationFailed => "check the repository user name and password",
            Self::RepositoryNotFound => "check the repository address",
            Self::EmptyRemoteRepository => "push at least one commit to the repository",
            Self::ReferenceNotFound { .. } => "check the branch name in the repository",
            Self::SshKeyMissing => "add the builder public key to the repository",
            Self::DeadlineExceeded(_) => "check that the repository is reachable from the builder",
            Self::Git(_) => "check that the repository is reachable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Ssh,
    Http,
    Git,
    Local,
}

impl Protocol {
    fn of(url: &str) -> Self {
        if url.starts_with("ssh://") || is_scp_like(url) {
            Self::Ssh
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Self::Http
        } else if url.starts_with("git://") {
            Self::Git
        } else {
            Self::Local
        }
    }
}

/// `user@host:path` form.
fn is_scp_like(url: &str) -> bool {
    match (url.find('@'), url.find(':')) {
        (Some(at), Some(colon)) => at < colon && !url[..colon].contains('/'),
        _ => false,
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', ':']).next().unwrap_or("");
    authority.rsplit('@').next().unwrap_or(authority)
}

fn is_github(url: &str) -> bool {
    let host = host_of(url);
    host == "github.com" || host.ends_with(".github.com")
}

fn find_ssh_key(ssh_dir: &Path) -> Option<PathBuf> {
    ["builder_rsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

/// Clone `source` into `target`.
///
/// Every call clones into a fresh sibling of `target` and moves it into
/// place once the checkout is complete, replacing an existing `target`. A
/// clone abandoned at its deadline keeps writing only to its own staging
/// directory, which is removed when the clone thread returns.
///
/// Progress is written to `logger` at debug level; a classified failure is
/// written as an error tagged `step=callback, status=failure`.
pub async fn clone_repository(
    source: &CodeSource,
    target: &Path,
    options: &CloneOptions,
    logger: Arc<dyn Logger>,
) -> Result<ClonedRepository, SourceError> {
    let timeout = options.timeout.max(MIN_CLONE_TIMEOUT);
    let deadline = Instant::now() + timeout;
    let staging = staging_dir(target);

    debug!(
        repo_url = %source.repo_url,
        branch = %source.branch,
        target = %target.display(),
        staging = %staging.display(),
        "Cloning repository"
    );

    let mut blocking = {
        let source = source.clone();
        let staging = staging.clone();
        let options = options.clone();
        let logger = logger.clone();
        tokio::task::spawn_blocking(move || {
            clone_blocking(&source, &staging, &options, deadline, timeout, logger.as_ref())
        })
    };

    let mut abandoned = false;
    let finished = tokio::time::timeout(timeout + CLONE_GRACE, &mut blocking).await;
    let result = match finished {
        Ok(Ok(Ok(cloned))) => promote(cloned, &staging, target).await,
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(e)) => Err(SourceError::Git(format!("clone task failed: {}", e))),
        Err(_) => {
            abandoned = true;
            let leftover = staging.clone();
            tokio::spawn(async move {
                // The clone thread cannot be interrupted.
                let _ = blocking.await;
                remove_checkout(&leftover).await;
            });
            Err(SourceError::DeadlineExceeded(timeout))
        }
    };

    if let Err(e) = &result {
        if !abandoned {
            remove_checkout(&staging).await;
        }
        remove_checkout(target).await;
        warn!(repo_url = %source.repo_url, category = e.category(), error = %e, "Clone failed");
        logger.error(
            &format!("Clone code failure: {}", e),
            attrs([("step", "callback"), ("status", "failure")]),
        );
    }

    result
}

/// Per-call clone directory next to `target`.
fn staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkout".to_string());
    target.with_file_name(format!(".{}.{}", name, uuid::Uuid::new_v4().simple()))
}

async fn promote(cloned: ClonedRepository, staging: &Path, target: &Path) -> Result<ClonedRepository, SourceError> {
    remove_checkout(target).await;
    tokio::fs::rename(staging, target)
        .await
        .map_err(|e| SourceError::Git(format!("cannot move checkout into {}: {}", target.display(), e)))?;
    Ok(ClonedRepository {
        path: target.to_path_buf(),
        ..cloned
    })
}

async fn remove_checkout(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %dir.display(), error = %e, "Failed to remove partial checkout");
    }
}

fn clone_blocking(
    source: &CodeSource,
    target: &Path,
    options: &CloneOptions,
    deadline: Instant,
    timeout: Duration,
    logger: &dyn Logger,
) -> Result<ClonedRepository, SourceError> {
    let protocol = Protocol::of(&source.repo_url);
    let ssh_key = match protocol {
        Protocol::Ssh => Some(find_ssh_key(&options.ssh_dir).ok_or(SourceError::AuthenticationRequired)?),
        _ => None,
    };
    let user = source.user.as_deref().filter(|u| !u.is_empty());
    let password = source.password.as_deref().unwrap_or("");

    let mut callbacks = RemoteCallbacks::new();
    let mut credential_requests = 0u32;
    callbacks.credentials(|_url, username_from_url, allowed| {
        credential_requests += 1;
        let class = if protocol == Protocol::Ssh {
            ErrorClass::Ssh
        } else {
            ErrorClass::Http
        };
        if credential_requests > 1 {
            return Err(git2::Error::new(ErrorCode::Auth, class, "credentials rejected"));
        }
        if let Some(key) = &ssh_key
            && allowed.contains(CredentialType::SSH_KEY)
        {
            return Cred::ssh_key(username_from_url.unwrap_or("git"), None, key, None);
        }
        if let Some(user) = user
            && allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
        {
            return Cred::userpass_plaintext(user, password);
        }
        Err(git2::Error::new(ErrorCode::Auth, class, "authentication required"))
    });
    if protocol == Protocol::Ssh {
        callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
    }
    let mut last_percent = 0usize;
    callbacks.transfer_progress(|stats| {
        if Instant::now() >= deadline {
            return false;
        }
        if stats.total_objects() > 0 {
            let percent = stats.received_objects() * 100 / stats.total_objects();
            if percent >= last_percent + 10 {
                last_percent = percent;
                logger.debug(
                    &format!(
                        "Receiving objects: {}% ({}/{})",
                        percent,
                        stats.received_objects(),
                        stats.total_objects()
                    ),
                    attrs([("step", "progress")]),
                );
            }
        }
        true
    });
    callbacks.sideband_progress(|data| {
        let line = String::from_utf8_lossy(data);
        let line = line.trim();
        if !line.is_empty() {
            logger.debug(line, attrs([("step", "progress")]));
        }
        Instant::now() < deadline
    });

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if let Some(proxy) = options.github_proxy.as_deref()
        && is_github(&source.repo_url)
    {
        let mut proxy_options = ProxyOptions::new();
        proxy_options.url(proxy);
        fetch.proxy_options(proxy_options);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    let repo = builder
        .clone(&source.repo_url, target)
        .map_err(|e| classify(&e, protocol, user.is_some(), deadline, timeout))?;

    if repo.is_empty().map_err(git_error)? {
        return Err(SourceError::EmptyRemoteRepository);
    }

    if !source.branch.is_empty() {
        checkout_reference(&repo, &source.branch)?;
    }

    let head = {
        let commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(git_error)?;
        CommitInfo {
            hash: commit.id().to_string(),
            author: commit.author().name().unwrap_or_default().to_string(),
            message: commit.summary().unwrap_or_default().to_string(),
        }
    };

    let branches = remote_branches(&repo);

    Ok(ClonedRepository {
        path: target.to_path_buf(),
        head,
        branches,
    })
}

fn git_error(e: git2::Error) -> SourceError {
    SourceError::Git(e.message().to_string())
}

fn classify(
    e: &git2::Error,
    protocol: Protocol,
    has_credentials: bool,
    deadline: Instant,
    timeout: Duration,
) -> SourceError {
    if Instant::now() >= deadline {
        return SourceError::DeadlineExceeded(timeout);
    }

    let auth_failure = || match protocol {
        Protocol::Ssh => SourceError::SshKeyMissing,
        _ if has_credentials => SourceError::AuthorizationFailed,
        _ => SourceError::AuthenticationRequired,
    };

    match e.code() {
        ErrorCode::Auth => return auth_failure(),
        ErrorCode::NotFound => return SourceError::RepositoryNotFound,
        _ => {}
    }

    let message = e.message().to_lowercase();
    if message.contains("401") || message.contains("authentication") {
        auth_failure()
    } else if message.contains("403") {
        SourceError::AuthorizationFailed
    } else if message.contains("404")
        || message.contains("not found")
        || message.contains("does not exist")
        || message.contains("could not find repository")
    {
        SourceError::RepositoryNotFound
    } else if message.contains("timed out") {
        SourceError::DeadlineExceeded(timeout)
    } else {
        SourceError::Git(e.message().to_string())
    }
}

fn checkout_reference(repo: &Repository, reference: &str) -> Result<(), SourceError> {
    let current = repo
        .head()
        .ok()
        .and_then(|h| h.shorthand().map(str::to_string));
    if current.as_deref() == Some(reference) {
        return Ok(());
    }

    let remote_branch = format!("refs/remotes/origin/{}", reference);
    match repo.find_reference(&remote_branch) {
        Ok(found) => {
            let commit = found.peel_to_commit().map_err(git_error)?;
            repo.branch(reference, &commit, true).map_err(git_error)?;
            repo.set_head(&format!("refs/heads/{}", reference))
                .map_err(git_error)?;
        }
        Err(e) if e.code() == ErrorCode::NotFound => {
            let tag = format!("refs/tags/{}", reference);
            let commit = repo
                .find_reference(&tag)
                .and_then(|t| t.peel_to_commit())
                .map_err(|_| SourceError::ReferenceNotFound {
                    reference: reference.to_string(),
                })?;
            repo.set_head_detached(commit.id()).map_err(git_error)?;
        }
        Err(e) => return Err(git_error(e)),
    }

    repo.checkout_head(Some(CheckoutBuilder::new().force()))
        .map_err(git_error)
}

fn remote_branches(repo: &Repository) -> Vec<String> {
    let Ok(branches) = repo.branches(Some(BranchType::Remote)) else {
        return Vec::new();
    };
    branches
        .filter_map(|b| b.ok())
        .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
        .filter_map(|name| name.strip_prefix("origin/").map(str::to_string))
        .filter(|name| name != "HEAD")
        .collect()
}
